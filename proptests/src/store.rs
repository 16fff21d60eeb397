//! Property tests for the piece writer.
//!
//! - ST-1: committed piece bytes equal the concatenation of the streamed
//!   chunks, whatever the chunking
//! - ST-2: the writer's running hash equals the hash of the whole payload

use crate::strategies::*;
use common::{OrderLimit, PieceAction, PieceHeader, PieceId, SerialNumber};
use node::pieces::PieceStore;
use proptest::prelude::*;

fn header_for(piece: PieceId, hash: [u8; 32]) -> PieceHeader {
    PieceHeader {
        hash,
        creation_time: 1_700_000_000,
        uplink_signature: vec![0u8; 64],
        order_limit: OrderLimit {
            coordinator_id: public(&key(1)),
            uplink_key: public(&key(2)),
            node_id: public(&key(3)),
            piece_id: piece,
            action: PieceAction::Put,
            byte_limit: 1 << 24,
            serial: SerialNumber([1u8; 16]),
            issued_at: 1_700_000_000,
            order_expiration: 1_700_003_600,
            piece_expiration: 0,
            signature: vec![0u8; 64],
        },
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// ST-1 and ST-2: arbitrary chunkings of arbitrary payloads commit to
    /// exactly the payload, with the matching streaming hash.
    #[test]
    fn prop_chunked_writes_commit_exact_bytes(
        payload in prop::collection::vec(any::<u8>(), 1..64 * 1024),
        chunk_size in 1usize..8192,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let store =
            PieceStore::open(dir.path().join("store"), &dir.path().join("exp.redb")).unwrap();
        let coordinator = public(&key(1));
        let piece = PieceId([9u8; 32]);

        let mut writer = store.writer(&coordinator, &piece).unwrap();
        let mut offset = 0u64;
        for chunk in payload.chunks(chunk_size) {
            prop_assert_eq!(writer.size(), offset, "writer size tracks offsets");
            writer.write(chunk).unwrap();
            offset += chunk.len() as u64;
        }
        prop_assert_eq!(writer.size(), payload.len() as u64);

        let hash = writer.hash();
        prop_assert_eq!(hash, *blake3::hash(&payload).as_bytes());

        writer.commit(&header_for(piece, hash)).unwrap();
        let mut reader = store.reader(&coordinator, &piece).unwrap();
        prop_assert_eq!(reader.size(), payload.len() as u64);
        let read_back = reader.read_at(0, payload.len()).unwrap();
        prop_assert_eq!(read_back, payload);
    }
}
