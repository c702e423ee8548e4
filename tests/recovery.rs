use anyhow::{Context as _, Result};
use bitcoin::hashes::{Hash as _, sha256};
use bitcoin::key::CompressedPublicKey;
use bitcoin::secp256k1::{Secp256k1, SecretKey};
use bitcoin::{Address, Network, PublicKey, Txid};
use ln_chain_swap::chain::htlc::EscrowScript;
use ln_chain_swap::chain::sweep::SweepRecord;
use ln_chain_swap::chain::{Deposit, KeyLocator};
use ln_chain_swap::swap::recovery::{self, RECOVERY_VERSION};
use ln_chain_swap::swap::{Escrow, LegKind, SettlementLeg, Swap};
use ln_chain_swap::{SwapDirection, SwapError, SwapStatus};

fn key(byte: u8) -> Result<PublicKey> {
    let secp = Secp256k1::new();
    let secret = SecretKey::from_slice(&[byte; 32]).context("secret key")?;
    Ok(PublicKey::new(secret.public_key(&secp)))
}

fn refund_address() -> Result<Address> {
    let secp = Secp256k1::new();
    let secret = SecretKey::from_slice(&[5u8; 32]).context("secret key")?;
    Ok(Address::p2wpkh(
        &CompressedPublicKey(secret.public_key(&secp)),
        Network::Regtest,
    ))
}

fn swap_out_fixture() -> Result<Swap> {
    let secret = [11u8; 32];
    let id = sha256::Hash::hash(&secret).to_byte_array();
    let script = EscrowScript {
        payment_hash: id,
        claim_public_key: key(1)?,
        refund_public_key: key(2)?,
        timeout_height: 900,
    };

    Ok(Swap {
        id,
        direction: SwapDirection::Out,
        tokens: 250_000,
        fee_budget: Some(3_000),
        service_fee: 2_500,
        prepay_tokens: 1_000,
        funding_confirmations: 3,
        escrow: Some(Escrow {
            version: RECOVERY_VERSION,
            script: script.witness_script(),
            claim_public_key: script.claim_public_key,
            refund_public_key: script.refund_public_key,
            address: script.address(Network::Regtest),
            secret: Some(secret),
            timeout_height: script.timeout_height,
            start_height: 400,
            key: KeyLocator {
                family: 42069,
                index: 7,
            },
        }),
        status: SwapStatus::Sweeping,
        deposit: Some(Deposit {
            transaction_id: Txid::hash(b"deposit"),
            output_index: 1,
            output_tokens: 250_000,
            confirmed_height: Some(405),
        }),
        settlement: vec![SettlementLeg {
            kind: LegKind::Funding,
            request: "lnbcrt251500n1".to_owned(),
            payment_id: hex::encode(id),
            is_confirmed: true,
            mtokens: 251_500_000,
            fee_mtokens: 1_200,
        }],
        refund_address: Some(refund_address()?),
        sweeps: vec![
            SweepRecord {
                transaction_id: Txid::hash(b"sweep"),
                fee_rate_sat_kwu: 2_500,
                output_tokens: 248_800,
            },
            SweepRecord {
                transaction_id: Txid::hash(b"bumped sweep"),
                fee_rate_sat_kwu: 3_000,
                output_tokens: 248_500,
            },
        ],
        swept: None,
        recovery_token: None,
    })
}

#[test]
fn token_restores_every_field() -> Result<()> {
    let swap = swap_out_fixture()?;
    let token = recovery::encode(&swap, Network::Regtest)?;
    assert!(token.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));

    let recovered = recovery::decode(&format!("  {token}\n"))?;
    assert_eq!(recovered.network, Network::Regtest);
    assert_eq!(
        recovered.swap,
        Swap {
            recovery_token: Some(token),
            ..swap
        }
    );
    Ok(())
}

#[test]
fn swap_in_token_has_no_secret() -> Result<()> {
    let mut swap = swap_out_fixture()?;
    swap.direction = SwapDirection::In;
    swap.prepay_tokens = 0;
    if let Some(escrow) = swap.escrow.as_mut() {
        escrow.secret = None;
    }
    let token = recovery::decode(&recovery::encode(&swap, Network::Regtest)?)?;
    assert_eq!(token.swap.direction, SwapDirection::In);
    assert!(token.swap.escrow()?.secret.is_none());

    // A swap-in never holds the preimage.
    let mut tampered = swap_out_fixture()?;
    tampered.direction = SwapDirection::In;
    let err = recovery::decode(&recovery::encode(&tampered, Network::Regtest)?)
        .expect_err("secret on swap-in");
    assert!(matches!(err, SwapError::FailedToDecodeSwapRecovery(_)));
    Ok(())
}

#[test]
fn rejects_malformed_tokens() -> Result<()> {
    let err = recovery::decode("not hex").expect_err("bad hex");
    assert!(matches!(err, SwapError::FailedToDecodeSwapRecovery(_)));

    let err = recovery::decode(&hex::encode(b"{\"version\":2}")).expect_err("unknown version");
    assert!(err.to_string().contains("unsupported version 2"));

    let err = recovery::decode(&hex::encode(b"{\"version\":1}")).expect_err("missing fields");
    assert!(matches!(err, SwapError::FailedToDecodeSwapRecovery(_)));

    let err = recovery::decode(&hex::encode(b"[]")).expect_err("not an object");
    assert!(matches!(err, SwapError::FailedToDecodeSwapRecovery(_)));
    Ok(())
}

#[test]
fn rejects_tokens_that_do_not_match_their_script() -> Result<()> {
    let token = recovery::encode(&swap_out_fixture()?, Network::Regtest)?;
    let raw = hex::decode(&token)?;
    let mut doc: serde_json::Value = serde_json::from_slice(&raw)?;

    doc["timeout_height"] = serde_json::json!(901);
    let err = recovery::decode(&hex::encode(serde_json::to_vec(&doc)?))
        .expect_err("timeout mismatch");
    assert!(err.to_string().contains("does not match"));

    doc["timeout_height"] = serde_json::json!(900);
    doc["secret"] = serde_json::json!(hex::encode([12u8; 32]));
    let err = recovery::decode(&hex::encode(serde_json::to_vec(&doc)?))
        .expect_err("wrong secret");
    assert!(err.to_string().contains("does not hash"));

    doc["secret"] = serde_json::json!(hex::encode([11u8; 32]));
    doc["id"] = serde_json::json!(hex::encode([0u8; 32]));
    let err = recovery::decode(&hex::encode(serde_json::to_vec(&doc)?)).expect_err("wrong id");
    assert!(matches!(err, SwapError::FailedToDecodeSwapRecovery(_)));
    Ok(())
}

#[test]
fn refund_address_must_match_network() -> Result<()> {
    let token = recovery::encode(&swap_out_fixture()?, Network::Regtest)?;
    let mut doc: serde_json::Value = serde_json::from_slice(&hex::decode(&token)?)?;
    doc["network"] = serde_json::json!("bitcoin");
    let err = recovery::decode(&hex::encode(serde_json::to_vec(&doc)?))
        .expect_err("regtest address on mainnet");
    assert!(err.to_string().contains("refund address"));
    Ok(())
}
