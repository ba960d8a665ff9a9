//! CBOR encoding of typed message payloads.

use crate::WireError;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Encode a value as CBOR
pub fn encode_payload<T: Serialize>(value: &T) -> Result<Bytes, WireError> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| WireError::Encode(e.to_string()))?;
    Ok(Bytes::from(buf))
}

/// Decode a CBOR value
pub fn decode_payload<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, WireError> {
    ciborium::from_reader(bytes).map_err(|e| WireError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{LinkStateAdvertisement, LsaPayload, LsaReason, NodeId};

    #[test]
    fn test_lsa_payload_through_cbor() {
        let owner = NodeId::new("owner").unwrap();
        let lsa = LinkStateAdvertisement {
            owner: owner.clone(),
            owner_display_name: "Owner".into(),
            sequence_number: 9,
            is_relay: true,
            graph_hash: 0xdead_beef,
            reason: LsaReason::Update,
            links: vec![crate::Link::new(owner, NodeId::new("n2").unwrap(), "c")],
        };

        let bytes = encode_payload(&LsaPayload::Single(lsa.clone())).unwrap();
        match decode_payload::<LsaPayload>(&bytes).unwrap() {
            LsaPayload::Single(decoded) => assert_eq!(decoded, lsa),
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn test_decode_garbage_fails() {
        let result = decode_payload::<LsaPayload>(&[0xff, 0x00, 0x13]);
        assert!(matches!(result, Err(WireError::Decode(_))));
    }
}
