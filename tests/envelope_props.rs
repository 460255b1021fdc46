//! Property tests for the sealed envelope format.

use agentlink::agent::AgentId;
use agentlink::envelope::{Codec, Envelope, MessageType, PaddingStrategy, ReplayGuard};
use agentlink::pake::{Role, SessionKey};
use bytes::Bytes;
use proptest::prelude::*;

fn keys(id: &AgentId, raw: &[u8]) -> (SessionKey, SessionKey) {
    (
        SessionKey::derive(raw, id, Role::Agent).unwrap(),
        SessionKey::derive(raw, id, Role::Server).unwrap(),
    )
}

fn message_type() -> impl Strategy<Value = MessageType> {
    prop_oneof![
        Just(MessageType::CheckIn),
        Just(MessageType::JobRequest),
        Just(MessageType::JobResult),
        Just(MessageType::Control),
    ]
}

fn padding() -> impl Strategy<Value = PaddingStrategy> {
    prop_oneof![
        Just(PaddingStrategy::None),
        (1usize..512).prop_map(|max| PaddingStrategy::Randomized { max }),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Whatever the agent seals, the server opens unchanged, across the wire.
    #[test]
    fn prop_seal_open_roundtrip(
        payload in proptest::collection::vec(any::<u8>(), 0..4096),
        raw in proptest::collection::vec(any::<u8>(), 32..96),
        kind in message_type(),
        padding in padding(),
    ) {
        let id = AgentId::new();
        let (agent_key, server_key) = keys(&id, &raw);
        let agent = Codec::new(id, padding, None);
        let server = Codec::new(id, PaddingStrategy::None, Some(ReplayGuard::default()));

        let sealed = agent.seal(&agent_key, &payload, kind).unwrap();
        let decoded = Envelope::decode(sealed.encode()).unwrap();
        prop_assert_eq!(decoded.message_type, kind);
        prop_assert_eq!(server.open(&server_key, &decoded).unwrap(), payload);

        // The same envelope never opens twice
        prop_assert!(server.open(&server_key, &decoded).is_err());
    }

    /// Flipping any single bit of a sealed envelope makes it unopenable.
    #[test]
    fn prop_bit_flip_rejected(
        payload in proptest::collection::vec(any::<u8>(), 1..256),
        position in any::<prop::sample::Index>(),
        bit in 0u8..8,
    ) {
        let id = AgentId::new();
        let (agent_key, server_key) = keys(&id, &[0x5a; 64]);
        let agent = Codec::new(id, PaddingStrategy::None, None);
        let server = Codec::new(id, PaddingStrategy::None, None);

        let mut wire = agent
            .seal(&agent_key, &payload, MessageType::CheckIn)
            .unwrap()
            .encode()
            .to_vec();
        let at = position.index(wire.len());
        wire[at] ^= 1 << bit;

        let opened = Envelope::decode(Bytes::from(wire))
            .and_then(|envelope| server.open(&server_key, &envelope));
        prop_assert!(opened.is_err());
    }

    /// Arbitrary bytes never decode into something that opens.
    #[test]
    fn prop_garbage_never_opens(data in proptest::collection::vec(any::<u8>(), 0..512)) {
        let id = AgentId::new();
        let (_, server_key) = keys(&id, &[0x5a; 64]);
        let server = Codec::new(id, PaddingStrategy::None, None);

        if let Ok(envelope) = Envelope::decode(Bytes::from(data)) {
            prop_assert!(server.open(&server_key, &envelope).is_err());
        }
    }
}
