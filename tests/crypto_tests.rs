//! Cryptographic identity tests
//!
//! - Base58 codec behaviour, including leading zeros and bad input
//! - Ed25519 signing over transaction contents
//! - Transaction hashing and verification helpers


use ledger_core::crypto::{
    self, decode, derive_public_key, encode, generate_keypair, sign, sign_transaction, transaction_hash,
    verify, verify_transaction, CryptoError,
};
use ledger_core::protocol::UnsignedTransaction;
use test_helpers::*;

// ============================================================================
// BASE58
// ============================================================================

#[test]
fn test_codec_preserves_leading_zero_bytes() {
    let samples: [&[u8]; 5] = [&[], &[0], &[0, 0, 0, 1], &[0, 255, 0, 255], &[1, 2, 3, 4, 5, 6, 7, 8]];
    for bytes in samples {
        let text = encode(bytes);
        assert_eq!(
            text.chars().take_while(|c| *c == '1').count(),
            bytes.iter().take_while(|b| **b == 0).count(),
            "one leading '1' per leading zero byte"
        );
        assert_eq!(decode(&text).unwrap(), bytes);
    }
}

#[test]
fn test_empty_string_decodes_to_empty_bytes() {
    assert_eq!(decode("").unwrap(), Vec::<u8>::new());
}

#[test]
fn test_decode_reports_offending_character() {
    let err = decode("abc0def").unwrap_err();
    assert_eq!(err, CryptoError::InvalidBase58 { character: '0', position: 3 });
}

// ============================================================================
// SIGNATURES
// ============================================================================

#[test]
fn test_generated_keypair_signs_and_verifies() {
    let keypair = generate_keypair();
    assert_eq!(derive_public_key(&keypair.private_key).unwrap(), keypair.public_key);
    assert_eq!(decode(&keypair.public_key).unwrap().len(), 32);

    let signature = sign(b"ledger", &keypair.private_key).unwrap();
    assert!(verify(b"ledger", &signature, &keypair.public_key));
    assert!(!verify(b"ledger!", &signature, &keypair.public_key));
}

#[test]
fn test_verify_never_panics_on_garbage() {
    let keypair = alice();
    let signature = keypair.sign(b"msg").unwrap();

    assert!(!verify(b"msg", "not-base58-0OIl", &keypair.public_key));
    assert!(!verify(b"msg", &signature, "0000"));
    assert!(!verify(b"msg", &encode(&[1u8; 10]), &keypair.public_key));
    assert!(!verify(b"msg", &signature, &encode(&[1u8; 31])));
    assert!(!verify(b"msg", "", ""));
}

// ============================================================================
// TRANSACTIONS
// ============================================================================

#[test]
fn test_signed_transaction_verifies() {
    let tx = transfer(&alice(), bob().address(), 100, 0);
    assert!(verify_transaction(&tx));
    assert_eq!(transaction_hash(&tx), tx.hash);
    assert!(verify(&crypto::signing_message(&tx), &tx.signature, &tx.from));
}

#[test]
fn test_altered_fields_fail_verification() {
    let original = transfer(&alice(), bob().address(), 100, 0);

    let mut more_value = original.clone();
    more_value.value = 1_000;
    let mut other_recipient = original.clone();
    other_recipient.to = carol().address().to_string();
    let mut bumped_nonce = original.clone();
    bumped_nonce.nonce = 1;
    let mut cheaper_gas = original.clone();
    cheaper_gas.gas_price = 0;

    for tampered in [more_value, other_recipient, bumped_nonce, cheaper_gas] {
        assert!(!tampered.verify_signature(), "signature must not cover altered fields");
        assert!(!verify_transaction(&tampered));
        // Same tampering always gives the same verdict
        assert!(!tampered.verify_signature());
    }
}

#[test]
fn test_sign_transaction_matches_method() {
    let keypair = alice();
    let unsigned = UnsignedTransaction {
        from: keypair.address().to_string(),
        to: bob().address().to_string(),
        value: 5,
        gas_price: 2,
        gas_limit: 21_000,
        nonce: 3,
        data: Some("memo".into()),
    };
    let via_fn = sign_transaction(unsigned.clone(), &keypair.private_key).unwrap();
    let via_method = unsigned.sign(&keypair.private_key).unwrap();
    // Ed25519 is deterministic
    assert_eq!(via_fn, via_method);
}

#[test]
fn test_hash_covers_signature() {
    let tx = transfer(&alice(), bob().address(), 1, 0);
    let mut resigned = tx.clone();
    resigned.signature = carol().sign(&tx.signing_message()).unwrap();
    assert_ne!(resigned.compute_hash(), tx.hash);
}
