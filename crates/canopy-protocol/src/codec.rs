use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ProtocolError, ProtocolResult};
use crate::message::Msg;

/// Upper bound on a single frame's JSON body.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Encode a frame: little-endian u64 byte length, then the JSON body.
pub fn encode(msg: &Msg) -> ProtocolResult<Vec<u8>> {
    let body = serde_json::to_vec(msg).map_err(|e| ProtocolError::Serialization(e.to_string()))?;
    if body.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size: body.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }
    let mut frame = Vec::with_capacity(8 + body.len());
    frame.extend_from_slice(&(body.len() as u64).to_le_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Decode one frame from a buffer. Returns the message and bytes consumed.
pub fn decode(buf: &[u8]) -> ProtocolResult<(Msg, usize)> {
    if buf.len() < 8 {
        return Err(ProtocolError::Framing("short length prefix".into()));
    }
    let len = u64::from_le_bytes(buf[..8].try_into().expect("length prefix is 8 bytes")) as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size: len,
            max: MAX_MESSAGE_SIZE,
        });
    }
    let total = 8 + len;
    if buf.len() < total {
        return Err(ProtocolError::Framing(format!(
            "incomplete frame: have {}, need {total}",
            buf.len()
        )));
    }
    let msg = serde_json::from_slice(&buf[8..total])
        .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
    Ok((msg, total))
}

/// Write one frame to an async stream.
pub async fn write_msg<W: AsyncWrite + Unpin>(writer: &mut W, msg: &Msg) -> ProtocolResult<()> {
    let frame = encode(msg)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame from an async stream.
pub async fn read_msg<R: AsyncRead + Unpin>(reader: &mut R) -> ProtocolResult<Msg> {
    let mut len_buf = [0u8; 8];
    reader.read_exact(&mut len_buf).await?;
    let len = u64::from_le_bytes(len_buf) as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size: len,
            max: MAX_MESSAGE_SIZE,
        });
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    serde_json::from_slice(&body).map_err(|e| ProtocolError::Serialization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::*;
    use canopy_tx::{parse_patch, Tx};
    use canopy_types::{Hash, TxId};

    fn sample_tx() -> Tx {
        Tx::new(
            TxId::from_static("one"),
            vec![TxId::genesis()],
            canopy_types::Address::from_bytes([0xaa; 20]),
            "p2p://talk",
            vec![parse_patch(r#".messages[0:0] = [{"t": "hi"}]"#).unwrap()],
        )
    }

    macro_rules! roundtrip_test {
        ($name:ident, $msg:expr) => {
            #[test]
            fn $name() {
                let msg = $msg;
                let frame = encode(&msg).unwrap();
                let (decoded, consumed) = decode(&frame).unwrap();
                assert_eq!(consumed, frame.len());
                assert_eq!(decoded.type_name(), msg.type_name());
            }
        };
    }

    roundtrip_test!(subscribe_roundtrip, Msg::Subscribe("p2p://talk".into()));
    roundtrip_test!(unsubscribe_roundtrip, Msg::Unsubscribe("p2p://talk".into()));
    roundtrip_test!(put_roundtrip, Msg::Put(sample_tx()));
    roundtrip_test!(ack_roundtrip, Msg::Ack(TxId::from_static("one")));
    roundtrip_test!(error_roundtrip, Msg::Error("nope".into()));
    roundtrip_test!(verify_address_roundtrip, Msg::VerifyAddress(vec![7; 32]));
    roundtrip_test!(
        verify_address_response_roundtrip,
        Msg::VerifyAddressResponse(VerifyAddressResponse {
            signature: vec![1; 65],
            encrypting_public_key: vec![2; 32],
        })
    );
    roundtrip_test!(fetch_ref_roundtrip, Msg::FetchRef(Hash::from_bytes([3; 32])));
    roundtrip_test!(
        fetch_ref_response_roundtrip,
        Msg::FetchRefResponse(FetchRefResponse::chunk(vec![1, 2, 3]))
    );
    roundtrip_test!(
        private_roundtrip,
        Msg::Private(EncryptedTx {
            tx_id: TxId::from_static("one"),
            encrypted_payload: vec![9; 48],
            sender_public_key: vec![8; 32],
        })
    );

    #[test]
    fn put_preserves_tx_content() {
        let tx = sample_tx();
        let frame = encode(&Msg::Put(tx.clone())).unwrap();
        let (decoded, _) = decode(&frame).unwrap();
        let Msg::Put(back) = decoded else {
            panic!("expected put");
        };
        assert_eq!(back.hash(), tx.hash());
        assert_eq!(back.patches, tx.patches);
    }

    #[test]
    fn decode_rejects_short_prefix() {
        assert!(matches!(
            decode(&[1, 2, 3]),
            Err(ProtocolError::Framing(_))
        ));
    }

    #[test]
    fn decode_rejects_truncated_body() {
        let frame = encode(&Msg::Error("hello".into())).unwrap();
        assert!(matches!(
            decode(&frame[..frame.len() - 1]),
            Err(ProtocolError::Framing(_))
        ));
    }

    #[test]
    fn decode_rejects_oversized_claim() {
        let mut frame = Vec::new();
        frame.extend_from_slice(&(u64::MAX).to_le_bytes());
        assert!(matches!(
            decode(&frame),
            Err(ProtocolError::MessageTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn async_stream_roundtrip() {
        let mut buf = Vec::new();
        write_msg(&mut buf, &Msg::Subscribe("p2p://talk".into()))
            .await
            .unwrap();
        write_msg(&mut buf, &Msg::Ack(TxId::from_static("one")))
            .await
            .unwrap();

        let mut reader = std::io::Cursor::new(buf);
        let first = read_msg(&mut reader).await.unwrap();
        let second = read_msg(&mut reader).await.unwrap();
        assert_eq!(first.type_name(), "subscribe");
        assert_eq!(second.type_name(), "ack");

        // Stream exhausted.
        assert!(read_msg(&mut reader).await.is_err());
    }
}
