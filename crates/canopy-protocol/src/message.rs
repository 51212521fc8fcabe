use serde::{Deserialize, Serialize};

use canopy_tx::Tx;
use canopy_types::{Hash, TxId};

/// Ref blobs stream in chunks of at most this many bytes.
pub const REF_CHUNK_SIZE: usize = 1024;

/// All message kinds exchanged between hosts.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum Msg {
    /// Ask the peer to stream txs for a state URI.
    #[serde(rename = "subscribe")]
    Subscribe(String),

    #[serde(rename = "unsubscribe")]
    Unsubscribe(String),

    /// Deliver a tx.
    #[serde(rename = "put")]
    Put(Tx),

    /// Deliver a sealed private tx.
    #[serde(rename = "private")]
    Private(EncryptedTx),

    /// Acknowledge receipt of a tx by ID.
    #[serde(rename = "ack")]
    Ack(TxId),

    #[serde(rename = "error")]
    Error(String),

    /// Identity challenge: random bytes the peer must sign.
    #[serde(rename = "verify address")]
    VerifyAddress(Vec<u8>),

    #[serde(rename = "verify address response")]
    VerifyAddressResponse(VerifyAddressResponse),

    /// Request a content-addressed blob.
    #[serde(rename = "fetch ref")]
    FetchRef(Hash),

    /// One frame of a blob transfer: a header first, then body chunks, the
    /// last with `end = true`.
    #[serde(rename = "fetch ref response")]
    FetchRefResponse(FetchRefResponse),
}

impl Msg {
    /// Stable name for logging.
    pub fn type_name(&self) -> &'static str {
        match self {
            Msg::Subscribe(_) => "subscribe",
            Msg::Unsubscribe(_) => "unsubscribe",
            Msg::Put(_) => "put",
            Msg::Private(_) => "private",
            Msg::Ack(_) => "ack",
            Msg::Error(_) => "error",
            Msg::VerifyAddress(_) => "verify address",
            Msg::VerifyAddressResponse(_) => "verify address response",
            Msg::FetchRef(_) => "fetch ref",
            Msg::FetchRefResponse(_) => "fetch ref response",
        }
    }
}

/// A private tx sealed to one recipient.
///
/// The wire field is named `txHash` for historical reasons; it carries the
/// tx *ID* and is checked against the decrypted tx's ID.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EncryptedTx {
    #[serde(rename = "txHash")]
    pub tx_id: TxId,
    #[serde(rename = "encryptedPayload")]
    pub encrypted_payload: Vec<u8>,
    #[serde(rename = "senderPublicKey")]
    pub sender_public_key: Vec<u8>,
}

/// Reply to an identity challenge: a recoverable signature over the
/// challenge hash plus the responder's encrypting public key.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VerifyAddressResponse {
    #[serde(rename = "signature")]
    pub signature: Vec<u8>,
    #[serde(rename = "encryptingPublicKey")]
    pub encrypting_public_key: Vec<u8>,
}

/// Exactly one of `header` or `body` is set per frame.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FetchRefResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header: Option<FetchRefResponseHeader>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<FetchRefResponseBody>,
}

impl FetchRefResponse {
    pub fn header() -> Self {
        Self {
            header: Some(FetchRefResponseHeader {}),
            body: None,
        }
    }

    pub fn chunk(data: Vec<u8>) -> Self {
        Self {
            header: None,
            body: Some(FetchRefResponseBody { data, end: false }),
        }
    }

    pub fn end() -> Self {
        Self {
            header: None,
            body: Some(FetchRefResponseBody {
                data: Vec::new(),
                end: true,
            }),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FetchRefResponseHeader {}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FetchRefResponseBody {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub data: Vec<u8>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub end: bool,
}
