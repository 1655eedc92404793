//! TLV payload for the scannable invoice code.
//!
//! Each field is written as `tag (1 byte) | length (1 byte) | value`, the
//! triples are concatenated in tag order and the whole buffer is base64
//! encoded.
use base64ct::{Base64, Encoding};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QrCodeError {
    #[error("TLV field {tag} exceeds 255 bytes (len={len})")]
    ValueTooLarge { tag: u8, len: usize },
    #[error("malformed QR buffer: {reason}")]
    MalformedBuffer { reason: String },
    #[error("QR payload is missing tag {0}")]
    MissingField(u8),
}

pub type QrResult<T> = std::result::Result<T, QrCodeError>;

/// The nine tags every payload carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum QrTag {
    SellerName = 1,
    VatNumber = 2,
    Timestamp = 3,
    TotalWithVat = 4,
    VatTotal = 5,
    InvoiceHash = 6,
    Signature = 7,
    PublicKey = 8,
    SignatureAlgorithm = 9,
}

impl QrTag {
    pub const ALL: [QrTag; 9] = [
        QrTag::SellerName,
        QrTag::VatNumber,
        QrTag::Timestamp,
        QrTag::TotalWithVat,
        QrTag::VatTotal,
        QrTag::InvoiceHash,
        QrTag::Signature,
        QrTag::PublicKey,
        QrTag::SignatureAlgorithm,
    ];

    pub fn from_u8(tag: u8) -> Option<QrTag> {
        QrTag::ALL.into_iter().find(|t| *t as u8 == tag)
    }
}

/// Raw triple as read from a buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlvField {
    pub tag: u8,
    pub value: Vec<u8>,
}

/// Field values for one invoice's code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QrFields {
    pub seller_name: String,
    pub vat_number: String,
    /// ISO-8601 issue timestamp.
    pub timestamp: String,
    pub total_with_vat: String,
    pub vat_total: String,
    pub invoice_hash: String,
    pub signature: String,
    pub public_key: String,
    pub signature_algorithm: String,
}

impl QrFields {
    fn value(&self, tag: QrTag) -> &str {
        match tag {
            QrTag::SellerName => &self.seller_name,
            QrTag::VatNumber => &self.vat_number,
            QrTag::Timestamp => &self.timestamp,
            QrTag::TotalWithVat => &self.total_with_vat,
            QrTag::VatTotal => &self.vat_total,
            QrTag::InvoiceHash => &self.invoice_hash,
            QrTag::Signature => &self.signature,
            QrTag::PublicKey => &self.public_key,
            QrTag::SignatureAlgorithm => &self.signature_algorithm,
        }
    }

    /// Encode all nine fields.
    ///
    /// # Examples
    /// ```rust
    /// use fatoora_compliance::qr::{QrFields, parse};
    ///
    /// let fields = QrFields {
    ///     seller_name: "شركة توريد".into(),
    ///     vat_number: "399999999900003".into(),
    ///     timestamp: "2024-01-14T10:26:49Z".into(),
    ///     total_with_vat: "1150.00".into(),
    ///     vat_total: "150.00".into(),
    ///     invoice_hash: "hash".into(),
    ///     signature: "sig".into(),
    ///     public_key: "key".into(),
    ///     signature_algorithm: "ecdsa-secp256k1-sha256".into(),
    /// };
    /// let encoded = fields.encode()?;
    /// assert_eq!(parse(&encoded)?, fields);
    /// # Ok::<(), fatoora_compliance::qr::QrCodeError>(())
    /// ```
    pub fn encode(&self) -> QrResult<String> {
        let mut tlv = TlvBuilder::new();
        for tag in QrTag::ALL {
            tlv.push_str(tag as u8, self.value(tag))?;
        }
        Ok(tlv.finish())
    }
}

struct TlvBuilder {
    bytes: Vec<u8>,
}

impl TlvBuilder {
    fn new() -> Self {
        Self { bytes: Vec::new() }
    }

    fn push_str(&mut self, tag: u8, value: &str) -> QrResult<()> {
        self.push_bytes(tag, value.as_bytes())
    }

    fn push_bytes(&mut self, tag: u8, value: &[u8]) -> QrResult<()> {
        let len = u8::try_from(value.len()).map_err(|_| QrCodeError::ValueTooLarge {
            tag,
            len: value.len(),
        })?;
        self.bytes.push(tag);
        self.bytes.push(len);
        self.bytes.extend_from_slice(value);
        Ok(())
    }

    fn finish(self) -> String {
        Base64::encode_string(&self.bytes)
    }
}

/// Encode arbitrary triples in the given order.
pub fn encode_fields(fields: &[TlvField]) -> QrResult<String> {
    let mut tlv = TlvBuilder::new();
    for field in fields {
        tlv.push_bytes(field.tag, &field.value)?;
    }
    Ok(tlv.finish())
}

/// Split a base64 payload into its triples.
pub fn decode(encoded: &str) -> QrResult<Vec<TlvField>> {
    let bytes = Base64::decode_vec(encoded.trim()).map_err(|e| QrCodeError::MalformedBuffer {
        reason: format!("invalid base64: {e}"),
    })?;

    let mut fields = Vec::new();
    let mut rest = bytes.as_slice();
    while !rest.is_empty() {
        let [tag, len, tail @ ..] = rest else {
            return Err(QrCodeError::MalformedBuffer {
                reason: format!("truncated header at offset {}", bytes.len() - rest.len()),
            });
        };
        let len = *len as usize;
        if tail.len() < len {
            return Err(QrCodeError::MalformedBuffer {
                reason: format!(
                    "tag {tag} declares {len} bytes but only {} remain",
                    tail.len()
                ),
            });
        }
        let (value, next) = tail.split_at(len);
        fields.push(TlvField {
            tag: *tag,
            value: value.to_vec(),
        });
        rest = next;
    }
    Ok(fields)
}

/// Decode and require all nine tags. Unknown tags are ignored; a repeated
/// tag keeps its first value.
pub fn parse(encoded: &str) -> QrResult<QrFields> {
    let mut values: [Option<String>; 9] = Default::default();
    for field in decode(encoded)? {
        let Some(tag) = QrTag::from_u8(field.tag) else {
            continue;
        };
        let slot = &mut values[tag as usize - 1];
        if slot.is_some() {
            continue;
        }
        let text = String::from_utf8(field.value).map_err(|_| QrCodeError::MalformedBuffer {
            reason: format!("tag {} is not valid UTF-8", field.tag),
        })?;
        *slot = Some(text);
    }

    let mut take = |tag: QrTag| {
        values[tag as usize - 1]
            .take()
            .ok_or(QrCodeError::MissingField(tag as u8))
    };
    Ok(QrFields {
        seller_name: take(QrTag::SellerName)?,
        vat_number: take(QrTag::VatNumber)?,
        timestamp: take(QrTag::Timestamp)?,
        total_with_vat: take(QrTag::TotalWithVat)?,
        vat_total: take(QrTag::VatTotal)?,
        invoice_hash: take(QrTag::InvoiceHash)?,
        signature: take(QrTag::Signature)?,
        public_key: take(QrTag::PublicKey)?,
        signature_algorithm: take(QrTag::SignatureAlgorithm)?,
    })
}
