//! Property-based round-trip coverage for the AEAD layer

use proptest::prelude::*;
use vaulthalla_crypto::Aes256GcmCipher;

proptest! {
    #[test]
    fn roundtrip_any_payload(plaintext in proptest::collection::vec(any::<u8>(), 0..4096)) {
        let cipher = Aes256GcmCipher::new(&[9u8; 32]).unwrap();
        let (iv, ciphertext) = cipher.encrypt(&plaintext, b"").unwrap();
        let decrypted = cipher.decrypt(&iv, &ciphertext, b"").unwrap();
        prop_assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn flipped_byte_never_authenticates(
        plaintext in proptest::collection::vec(any::<u8>(), 1..512),
        flip_index in any::<usize>(),
    ) {
        let cipher = Aes256GcmCipher::new(&[9u8; 32]).unwrap();
        let (iv, mut ciphertext) = cipher.encrypt(&plaintext, b"").unwrap();
        let idx = flip_index % ciphertext.len();
        ciphertext[idx] ^= 0x01;
        prop_assert!(cipher.decrypt(&iv, &ciphertext, b"").is_err());
    }
}
