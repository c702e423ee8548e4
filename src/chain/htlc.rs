use anyhow::{Context as _, Result};
use bitcoin::absolute::LockTime;
use bitcoin::hashes::{Hash as _, ripemd160, sha256};
use bitcoin::opcodes::Opcode;
use bitcoin::opcodes::all::{
    OP_CHECKSIG, OP_CLTV, OP_DROP, OP_ELSE, OP_ENDIF, OP_EQUAL, OP_EQUALVERIFY, OP_HASH160, OP_IF,
    OP_PUSHNUM_1, OP_PUSHNUM_16, OP_SIZE,
};
use bitcoin::script::{Builder, Instruction, Instructions, Script, ScriptBuf, read_scriptint};
use bitcoin::secp256k1::ecdsa::Signature;
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::transaction::Version;
use bitcoin::{
    Address, Amount, Network, OutPoint, PublicKey, Sequence, Transaction, TxIn, TxOut, Witness,
};

/// Size of the DER signature plus sighash flag used when estimating weight.
const MAX_SIGNATURE_LEN: usize = 73;

/// Hash/time-locked escrow paid to a P2WSH output.
///
/// The claim branch takes a 32 byte preimage of `payment_hash` and a signature
/// for `claim_public_key`; the refund branch takes any other item plus a
/// signature for `refund_public_key` once `timeout_height` is reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EscrowScript {
    pub payment_hash: [u8; 32],
    pub claim_public_key: PublicKey,
    pub refund_public_key: PublicKey,
    pub timeout_height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpendPath {
    Claim { preimage: [u8; 32] },
    Refund,
}

impl EscrowScript {
    pub fn witness_script(&self) -> ScriptBuf {
        Builder::new()
            .push_opcode(OP_SIZE)
            .push_int(32)
            .push_opcode(OP_EQUAL)
            .push_opcode(OP_IF)
            .push_opcode(OP_HASH160)
            .push_slice(ripemd160_of(&self.payment_hash))
            .push_opcode(OP_EQUALVERIFY)
            .push_key(&self.claim_public_key)
            .push_opcode(OP_ELSE)
            .push_opcode(OP_DROP)
            .push_int(i64::from(self.timeout_height))
            .push_opcode(OP_CLTV)
            .push_opcode(OP_DROP)
            .push_key(&self.refund_public_key)
            .push_opcode(OP_ENDIF)
            .push_opcode(OP_CHECKSIG)
            .into_script()
    }

    pub fn address(&self, network: Network) -> Address {
        Address::p2wsh(&self.witness_script(), network)
    }

    /// Parses a witness script produced by [`EscrowScript::witness_script`].
    ///
    /// The script only commits to `ripemd160(payment_hash)`, so the caller
    /// supplies the hash it expects and parsing fails if it does not match.
    pub fn parse(witness_script: &Script, payment_hash: [u8; 32]) -> Result<Self> {
        let mut script = ScriptReader::new(witness_script);

        script.op(OP_SIZE)?;
        let size = script.int()?;
        anyhow::ensure!(size == 32, "unexpected preimage size check: {size}");
        script.op(OP_EQUAL)?;
        script.op(OP_IF)?;

        script.op(OP_HASH160)?;
        let hash160 = script.bytes::<20>()?;
        anyhow::ensure!(
            hash160 == ripemd160_of(&payment_hash),
            "witness script does not commit to payment hash {}",
            hex::encode(payment_hash)
        );
        script.op(OP_EQUALVERIFY)?;
        let claim_public_key = script.key()?;

        script.op(OP_ELSE)?;
        script.op(OP_DROP)?;
        let timeout_height = script.int()?;
        let timeout_height = u32::try_from(timeout_height)
            .map_err(|_| anyhow::anyhow!("timeout_height out of range: {timeout_height}"))?;
        script.op(OP_CLTV)?;
        script.op(OP_DROP)?;
        let refund_public_key = script.key()?;

        script.op(OP_ENDIF)?;
        script.op(OP_CHECKSIG)?;
        script.finish()?;

        Ok(Self {
            payment_hash,
            claim_public_key,
            refund_public_key,
            timeout_height,
        })
    }
}

/// Cursor over the minimal instructions of a witness script.
struct ScriptReader<'a> {
    instructions: Instructions<'a>,
}

impl<'a> ScriptReader<'a> {
    fn new(script: &'a Script) -> Self {
        Self {
            instructions: script.instructions_minimal(),
        }
    }

    fn next(&mut self) -> Result<Instruction<'a>> {
        self.instructions
            .next()
            .transpose()
            .map_err(|e| anyhow::anyhow!("decode witness script: {e}"))?
            .context("witness script ends early")
    }

    fn op(&mut self, expected: Opcode) -> Result<()> {
        match self.next()? {
            Instruction::Op(op) if op == expected => Ok(()),
            other => anyhow::bail!("expected {expected:?}, found {other:?}"),
        }
    }

    /// Reads a number pushed either as `OP_1..OP_16` or as minimal bytes.
    fn int(&mut self) -> Result<i64> {
        match self.next()? {
            Instruction::PushBytes(bytes) => read_scriptint(bytes.as_bytes())
                .map_err(|e| anyhow::anyhow!("decode script number: {e}")),
            Instruction::Op(op) => {
                let first = OP_PUSHNUM_1.to_u8();
                let code = op.to_u8();
                anyhow::ensure!(
                    (first..=OP_PUSHNUM_16.to_u8()).contains(&code),
                    "expected a number, found {op:?}"
                );
                Ok(i64::from(code - first + 1))
            }
        }
    }

    fn bytes<const N: usize>(&mut self) -> Result<[u8; N]> {
        match self.next()? {
            Instruction::PushBytes(bytes) => <[u8; N]>::try_from(bytes.as_bytes())
                .map_err(|_| anyhow::anyhow!("expected a {N} byte push, found {}", bytes.len())),
            other => anyhow::bail!("expected a {N} byte push, found {other:?}"),
        }
    }

    fn key(&mut self) -> Result<PublicKey> {
        PublicKey::from_slice(&self.bytes::<33>()?).context("decode public key")
    }

    fn finish(mut self) -> Result<()> {
        anyhow::ensure!(
            self.instructions.next().is_none(),
            "unexpected trailing instructions in witness script"
        );
        Ok(())
    }
}

/// Builds the single-input, single-output spend of the escrow without a
/// witness. Refunds carry `timeout_height` as their locktime.
pub fn unsigned_spend(
    escrow: &EscrowScript,
    outpoint: OutPoint,
    destination: &Address,
    output_tokens: u64,
    path: SpendPath,
) -> Result<Transaction> {
    let lock_time = match path {
        SpendPath::Claim { .. } => LockTime::ZERO,
        SpendPath::Refund => LockTime::from_height(escrow.timeout_height)
            .context("timeout_height is invalid locktime")?,
    };

    Ok(Transaction {
        version: Version::TWO,
        lock_time,
        input: vec![TxIn {
            previous_output: outpoint,
            script_sig: ScriptBuf::new(),
            // 0xfffffffd signals replaceability and enables nLockTime.
            sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: Amount::from_sat(output_tokens),
            script_pubkey: destination.script_pubkey(),
        }],
    })
}

pub fn spend_sighash(
    tx: &Transaction,
    witness_script: &Script,
    input_tokens: u64,
) -> Result<[u8; 32]> {
    let mut cache = SighashCache::new(tx);
    let sighash = cache
        .p2wsh_signature_hash(
            0,
            witness_script,
            Amount::from_sat(input_tokens),
            EcdsaSighashType::All,
        )
        .context("compute segwit v0 sighash")?;
    Ok(sighash.to_byte_array())
}

pub fn apply_witness(
    mut tx: Transaction,
    witness_script: &Script,
    signature: Signature,
    path: SpendPath,
) -> Result<Transaction> {
    let input = tx.input.first_mut().context("spend has no input")?;

    let signature = bitcoin::ecdsa::Signature {
        signature,
        sighash_type: EcdsaSighashType::All,
    };

    let mut witness = Witness::new();
    witness.push(signature.to_vec());
    match path {
        SpendPath::Claim { preimage } => witness.push(preimage),
        SpendPath::Refund => witness.push(Vec::<u8>::new()),
    }
    witness.push(witness_script.as_bytes());
    input.witness = witness;

    Ok(tx)
}

/// Virtual size of a fully signed spend, using a worst-case signature.
pub fn estimated_spend_vsize(
    escrow: &EscrowScript,
    outpoint: OutPoint,
    destination: &Address,
    path: SpendPath,
) -> Result<u64> {
    let mut tx = unsigned_spend(escrow, outpoint, destination, 0, path)?;
    let witness_script = escrow.witness_script();

    let mut witness = Witness::new();
    witness.push([0u8; MAX_SIGNATURE_LEN]);
    match path {
        SpendPath::Claim { preimage } => witness.push(preimage),
        SpendPath::Refund => witness.push(Vec::<u8>::new()),
    }
    witness.push(witness_script.as_bytes());
    tx.input[0].witness = witness;

    Ok(tx.vsize() as u64)
}

pub fn sha256_preimage(preimage: &[u8; 32]) -> [u8; 32] {
    sha256::Hash::hash(preimage).to_byte_array()
}

fn ripemd160_of(payment_hash: &[u8; 32]) -> [u8; 20] {
    ripemd160::Hash::hash(payment_hash).to_byte_array()
}
