//! Integration tests for the user configuration block: decode, snapshot,
//! rebuild, and rejection of corrupted input.

use nortek_core::params::user_config::{
    nortek_registry, ADJUSTMENT_SOUND_SPEED, AVG_INTERVAL, A1_1_SPARE, CLOCK_DEPLOY, COMMENTS,
    COORDINATE_SYSTEM, DEPLOYMENT_NAME, DIAGNOSTIC_INTERVAL, MODE, TRANSMIT_PULSE_LENGTH,
    VELOCITY_ADJ_TABLE,
};
use nortek_core::protocol::chunker::{ChunkKind, Sieve, StreamChunker};
use nortek_core::protocol::codec::{checksum, int_to_double_word, int_to_word, seal_checksum, stored_checksum};
use nortek_core::protocol::frames::{USER_CONFIG, USER_CONFIG_LEN, USER_CONFIG_SYNC};
use nortek_core::protocol::ACK;
use nortek_core::{RegistryError, Value, VECTOR};

// ── Fixture ───────────────────────────────────────────────────────────────────

fn put_word(block: &mut [u8], offset: usize, value: u16) {
    block[offset..offset + 2].copy_from_slice(&int_to_word(value));
}

/// A user configuration block as a Vector returns it from `GC`.
fn reference_block() -> Vec<u8> {
    let mut block = vec![0u8; USER_CONFIG_LEN];
    block[..4].copy_from_slice(USER_CONFIG_SYNC);
    put_word(&mut block, 4, 2); // transmit pulse length
    put_word(&mut block, 6, 16); // blanking distance
    put_word(&mut block, 8, 7); // receive length
    put_word(&mut block, 10, 44); // time between pings
    put_word(&mut block, 14, 1); // number of pings
    put_word(&mut block, 16, 32); // average interval
    put_word(&mut block, 18, 3); // beams
    block[20..22].copy_from_slice(&[0x30, 0x01]);
    block[22..24].copy_from_slice(&[0x00, 0x08]);
    put_word(&mut block, 30, 1); // compass update rate
    put_word(&mut block, 32, 2); // coordinate system
    put_word(&mut block, 34, 1); // bins
    put_word(&mut block, 36, 7); // bin length
    put_word(&mut block, 38, 32); // measurement interval
    block[40..44].copy_from_slice(b"4943");
    block[48..54].copy_from_slice(&[0x29, 0x11, 0x17, 0x14, 0x13, 0x06]);
    block[54..58].copy_from_slice(&int_to_double_word(43_200));
    block[58..60].copy_from_slice(&[0x37, 0x00]);
    put_word(&mut block, 60, 1525);
    put_word(&mut block, 62, 20);
    put_word(&mut block, 64, 1);
    put_word(&mut block, 66, 1);
    block[68..70].copy_from_slice(&[0x18, 0x00]);
    put_word(&mut block, 72, 13_902); // firmware build
    for (i, byte) in block[76..256].iter_mut().enumerate() {
        *byte = (i % 7) as u8 * 0x11;
    }
    block[256..268].copy_from_slice(b"Test comment");
    put_word(&mut block, 436, 0x0011);
    put_word(&mut block, 462, 2);
    block[494..510].copy_from_slice(&[
        0x7E, 0x00, 0x52, 0x00, 0x36, 0x00, 0x1A, 0x00, 0x7E, 0x00, 0x52, 0x00, 0x36, 0x00, 0x1A,
        0x00,
    ]);
    seal_checksum(&mut block, VECTOR.checksum_seed).expect("fixture checksum");
    block
}

fn with_ack(block: &[u8]) -> Vec<u8> {
    let mut out = block.to_vec();
    out.extend_from_slice(ACK);
    out
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[test]
fn test_reference_block_decodes_documented_values() {
    // Arrange
    let mut registry = nortek_registry(&VECTOR).unwrap();
    registry.seal();

    // Act
    registry.update_from_block(&with_ack(&reference_block())).unwrap();
    let config = registry.get_config();

    // Assert
    assert_eq!(config[TRANSMIT_PULSE_LENGTH], Value::Int(2));
    assert_eq!(config[AVG_INTERVAL], Value::Int(32));
    assert_eq!(config[COORDINATE_SYSTEM], Value::Int(2));
    assert_eq!(config[ADJUSTMENT_SOUND_SPEED], Value::Int(1525));
    assert_eq!(config[DIAGNOSTIC_INTERVAL], Value::Int(43_200));
    assert_eq!(config[DEPLOYMENT_NAME], Value::Str("4943".into()));
    assert_eq!(config[COMMENTS], Value::Str("Test comment".into()));
    assert_eq!(config[CLOCK_DEPLOY], Value::DateTime([29, 11, 17, 14, 13, 6]));
    assert!(matches!(&config[MODE], Value::Bits(bits) if bits.len() == 16));
    assert!(matches!(&config[VELOCITY_ADJ_TABLE], Value::Blob(b) if b.len() == 180));
    assert!(!config.contains_key(A1_1_SPARE));
}

#[test]
fn test_rebuilt_block_reproduces_original_bytes() {
    // Arrange
    let original = reference_block();
    let mut registry = nortek_registry(&VECTOR).unwrap();
    registry.update_from_block(&original).unwrap();

    // Act
    let rebuilt = registry.build_configuration_block().unwrap();

    // Assert
    assert_eq!(rebuilt, original);
    assert_eq!(
        checksum(&rebuilt, USER_CONFIG.length, VECTOR.checksum_seed).unwrap(),
        stored_checksum(&original).unwrap()
    );
}

#[test]
fn test_checksum_survives_decode_and_rebuild_for_varied_blocks() {
    for pulse in [0u16, 1, 2, 255, 4096, u16::MAX] {
        let mut block = reference_block();
        put_word(&mut block, 4, pulse);
        put_word(&mut block, 458, pulse / 3);
        seal_checksum(&mut block, VECTOR.checksum_seed).unwrap();

        let mut registry = nortek_registry(&VECTOR).unwrap();
        registry.update_from_block(&block).unwrap();
        let rebuilt = registry.build_configuration_block().unwrap();

        assert_eq!(stored_checksum(&rebuilt).unwrap(), stored_checksum(&block).unwrap());
    }
}

#[test]
fn test_local_set_shows_up_in_rebuilt_block() {
    // Arrange
    let mut registry = nortek_registry(&VECTOR).unwrap();
    registry.update_from_block(&reference_block()).unwrap();

    // Act
    registry.set_from_value(AVG_INTERVAL, Value::Int(61)).unwrap();
    let block = registry.build_configuration_block().unwrap();

    // Assert
    assert_eq!(&block[16..18], &int_to_word(61));
    let mut reread = nortek_registry(&VECTOR).unwrap();
    reread.update_from_block(&block).unwrap();
    assert_eq!(reread.value(AVG_INTERVAL).unwrap(), Some(&Value::Int(61)));
}

#[test]
fn test_foo_corrupted_reply_fails_validation() {
    // Arrange
    let mut corrupted = with_ack(&reference_block());
    corrupted.splice(100..102, b"foo".iter().copied());
    let mut registry = nortek_registry(&VECTOR).unwrap();
    let before = registry.get_config();

    // Act
    let result = registry.update_from_block(&corrupted);

    // Assert
    assert!(matches!(result, Err(RegistryError::InvalidBlock(_))));
    assert_eq!(registry.get_config(), before);
}

#[test]
fn test_foo_corrupted_stream_yields_no_config_frame() {
    // Arrange
    let mut stream = reference_block();
    stream.splice(300..302, b"foo".iter().copied());
    stream.extend(reference_block());
    let mut chunker = StreamChunker::new(Sieve::new(VECTOR.frame_specs(), VECTOR.checksum_seed), 4096);

    // Act
    let chunks = chunker.push(&stream);

    // Assert
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].bytes, reference_block());
    assert!(matches!(chunks[0].kind, ChunkKind::Fixed(spec) if spec == USER_CONFIG));
}

#[test]
fn test_import_accepts_block_with_or_without_ack() {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;

    let block = reference_block();
    for blob in [STANDARD.encode(&block), STANDARD.encode(with_ack(&block))] {
        let mut registry = nortek_registry(&VECTOR).unwrap();
        registry.import_raw_config(&blob).unwrap();
        assert_eq!(registry.export_raw_config(), Some(STANDARD.encode(&block)));
    }
}
