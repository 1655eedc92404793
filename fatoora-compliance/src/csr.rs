//! Certificate signing requests for onboarding an EGS unit.
use crate::certificate::InvoiceCategory;
use crate::config::EnvironmentType;
use base64ct::{Base64, Encoding};
use fatoora_derive::Validate;
use isocountry::CountryCode;
use java_properties::read;
use k256::ecdsa::{DerSignature, SigningKey};
use sha2::{Digest, Sha256};
use std::{
    fs::File,
    io::BufReader,
    path::{Path, PathBuf},
    str::FromStr,
};
use thiserror::Error;
use tracing::debug;
use x509_cert::{
    builder::{Builder, RequestBuilder},
    der::{
        Encode, EncodePem, Error as DerError, Length, Result as DerResult, Writer, asn1,
        pem::LineEnding,
    },
    ext::{
        AsExtension, Extension,
        pkix::{SubjectAltName, name::GeneralName},
    },
    name,
    request::CertReq,
};

/// Errors that can occur while generating or validating CSRs.
#[derive(Debug, Error)]
pub enum CsrError {
    #[error("failed to open CSR config file '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse CSR properties from '{path}': {source}")]
    PropertiesRead {
        path: PathBuf,
        #[source]
        source: java_properties::PropertiesError,
    },

    #[error("missing required CSR property '{key}' in file '{path}'")]
    MissingProperty { path: PathBuf, key: String },

    #[error("invalid subject distinguished name constructed from provided fields: {message}")]
    InvalidSubject { message: String },

    #[error("invalid Subject Alternative Name (SAN) from fields: {message}")]
    InvalidSan { message: String },

    #[error("failed to construct CSR request: {message}")]
    RequestBuild { message: String },

    #[error("failed adding CSR extension '{which}': {message}")]
    AddExtension {
        which: &'static str,
        message: String,
    },

    #[error("failed DER encoding for {context}: {source}")]
    DerEncode {
        context: &'static str,
        #[source]
        source: DerError,
    },

    #[error("validation error: {message}")]
    Validation { message: String },
}

impl From<String> for CsrError {
    fn from(message: String) -> Self {
        CsrError::Validation { message }
    }
}

/// Microsoft certificate template name extension (1.3.6.1.4.1.311.20.2).
struct TemplateNameExtension(asn1::OctetString);

impl const_oid::AssociatedOid for TemplateNameExtension {
    const OID: const_oid::ObjectIdentifier =
        const_oid::ObjectIdentifier::new_unwrap("1.3.6.1.4.1.311.20.2");
}

impl Encode for TemplateNameExtension {
    fn encoded_len(&self) -> DerResult<Length> {
        self.0.encoded_len()
    }
    fn encode(&self, encoder: &mut impl Writer) -> DerResult<()> {
        self.0.encode(encoder)
    }
}

impl AsExtension for TemplateNameExtension {
    fn critical(&self, _name: &name::Name, _exts: &[Extension]) -> bool {
        false
    }
}

impl EnvironmentType {
    pub const fn certificate_template(&self) -> &'static str {
        match self {
            EnvironmentType::NonProduction => "TSTZATCA-Code-Signing",
            EnvironmentType::Simulation => "PREZATCA-Code-Signing",
            EnvironmentType::Production => "ZATCA-Code-Signing",
        }
    }

    fn to_extension(self) -> Result<TemplateNameExtension, CsrError> {
        let os = asn1::OctetString::new(self.certificate_template().as_bytes()).map_err(|e| {
            CsrError::RequestBuild {
                message: format!("invalid template name bytes for extension: {e}"),
            }
        })?;
        Ok(TemplateNameExtension(os))
    }
}

// RFC 4514 escaping for attribute values fed to the DN parser.
fn escape_dn_value(value: &str) -> String {
    let trimmed = value.trim();
    let mut out = String::with_capacity(trimmed.len());
    for (i, c) in trimmed.chars().enumerate() {
        let leading_special = i == 0 && matches!(c, '#' | ' ');
        if leading_special || matches!(c, ',' | '+' | '"' | '\\' | '<' | '>' | ';' | '=') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Organization identity written into the certificate request.
///
/// # Examples
/// ```rust
/// use fatoora_compliance::certificate::InvoiceCategory;
/// use fatoora_compliance::csr::CsrConfig;
///
/// let config = CsrConfig::new(
///     "TST-886431145-399999999900003".into(),
///     "1-TST|2-TST|3-ed22f1d8-e6a2-1118-9b58-d9a8f11e445f".into(),
///     "Maximum Speed Tech Supply LTD".into(),
///     "399999999900003".into(),
///     "Riyadh Branch".into(),
///     "SA".into(),
///     InvoiceCategory::Standard,
///     "RRRD2929".into(),
///     "Supply activities".into(),
/// )?;
/// assert_eq!(config.vat_number(), "399999999900003");
/// # Ok::<(), fatoora_compliance::csr::CsrError>(())
/// ```
#[derive(Validate, Debug, Clone, PartialEq, Eq)]
#[validate_error(CsrError)]
#[validate(non_empty)]
pub struct CsrConfig {
    common_name: String,
    #[validate(non_empty, is_egs_serial)]
    serial_number: String,
    organization_name: String,
    #[validate(non_empty, is_vat_number)]
    organization_identifier: String,
    organization_unit_name: String,
    #[validate(non_empty, is_country_code)]
    country_name: String,
    #[validate(skip)]
    invoice_category: InvoiceCategory,
    location_address: String,
    industry_business_category: String,
}

impl CsrConfig {
    pub fn common_name(&self) -> &str {
        &self.common_name
    }

    pub fn vat_number(&self) -> &str {
        self.organization_identifier.trim()
    }

    pub fn organization_name(&self) -> &str {
        &self.organization_name
    }

    pub fn invoice_category(&self) -> InvoiceCategory {
        self.invoice_category
    }

    /// Same identity, bound to another invoice category.
    pub fn for_category(&self, category: InvoiceCategory) -> Self {
        Self {
            invoice_category: category,
            ..self.clone()
        }
    }

    fn country(&self) -> Result<CountryCode, CsrError> {
        let code = CountryCode::for_alpha2_caseless(self.country_name.trim()).map_err(|e| {
            CsrError::Validation {
                message: format!("country_name: {e}"),
            }
        })?;
        if code != CountryCode::SAU {
            return Err(CsrError::Validation {
                message: format!("country_name must be SA, got {}", code.alpha2()),
            });
        }
        Ok(code)
    }

    fn generate_subject(&self) -> Result<name::Name, CsrError> {
        let country = self.country()?;
        name::Name::from_str(&format!(
            "C={},OU={},O={},CN={}",
            country.alpha2(),
            escape_dn_value(&self.organization_unit_name),
            escape_dn_value(&self.organization_name),
            escape_dn_value(&self.common_name)
        ))
        .map_err(|e| CsrError::InvalidSubject {
            message: e.to_string(),
        })
    }

    fn generate_san_extension(&self) -> Result<SubjectAltName, CsrError> {
        let name = name::Name::from_str(&format!(
            "sn={},uid={},title={},registeredAddress={},businessCategory={}",
            escape_dn_value(&self.serial_number),
            escape_dn_value(&self.organization_identifier),
            self.invoice_category.csr_title(),
            escape_dn_value(&self.location_address),
            escape_dn_value(&self.industry_business_category)
        ))
        .map_err(|e| CsrError::InvalidSan {
            message: e.to_string(),
        })?;
        Ok(SubjectAltName::from(vec![GeneralName::DirectoryName(name)]))
    }

    /// Build and self-sign the request with `signer`.
    pub fn build(&self, signer: &SigningKey, env: EnvironmentType) -> Result<CsrBundle, CsrError> {
        let subject = self.generate_subject()?;
        let template = env.to_extension()?;
        let san = self.generate_san_extension()?;

        let mut builder =
            RequestBuilder::new(subject, signer).map_err(|e| CsrError::RequestBuild {
                message: e.to_string(),
            })?;
        builder
            .add_extension(&template)
            .map_err(|e| CsrError::AddExtension {
                which: "TemplateName",
                message: e.to_string(),
            })?;
        builder
            .add_extension(&san)
            .map_err(|e| CsrError::AddExtension {
                which: "SubjectAltName",
                message: e.to_string(),
            })?;
        let request = builder
            .build::<DerSignature>()
            .map_err(|e| CsrError::RequestBuild {
                message: e.to_string(),
            })?;
        let bundle = CsrBundle::from_request(&request)?;
        debug!(
            subject = %bundle.subject(),
            fingerprint = %bundle.fingerprint(),
            template = env.certificate_template(),
            "built certificate request"
        );
        Ok(bundle)
    }

    /// Read the SDK-style `csr.*` properties file.
    pub fn from_properties(path: &Path) -> Result<CsrConfig, CsrError> {
        let pathbuf = path.to_path_buf();
        let file = File::open(path).map_err(|e| CsrError::Io {
            path: pathbuf.clone(),
            source: e,
        })?;
        let map = read(BufReader::new(file)).map_err(|e| CsrError::PropertiesRead {
            path: pathbuf.clone(),
            source: e,
        })?;

        let req = |key: &str| -> Result<String, CsrError> {
            map.get(key)
                .map(|s| s.to_string())
                .ok_or_else(|| CsrError::MissingProperty {
                    path: pathbuf.clone(),
                    key: key.to_string(),
                })
        };

        CsrConfig::new(
            req("csr.common.name")?,
            req("csr.serial.number")?,
            req("csr.organization.name")?,
            req("csr.organization.identifier")?,
            req("csr.organization.unit.name")?,
            req("csr.country.name")?,
            parse_invoice_type(&req("csr.invoice.type")?)?,
            req("csr.location.address")?,
            req("csr.industry.business.category")?,
        )
    }
}

fn parse_invoice_type(raw: &str) -> Result<InvoiceCategory, CsrError> {
    match raw.trim() {
        "1000" => Ok(InvoiceCategory::Standard),
        "0100" => Ok(InvoiceCategory::Simplified),
        other => other.parse().map_err(|_| CsrError::Validation {
            message: format!("csr.invoice.type must be 1000 or 0100, got '{other}'"),
        }),
    }
}

/// Encoded request plus the derived forms the pipeline needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsrBundle {
    der: Vec<u8>,
    pem: String,
    subject: String,
    fingerprint: String,
}

impl CsrBundle {
    fn from_request(request: &CertReq) -> Result<Self, CsrError> {
        let der = request.to_der().map_err(|e| CsrError::DerEncode {
            context: "certificate request",
            source: e,
        })?;
        let pem = request
            .to_pem(LineEnding::LF)
            .map_err(|e| CsrError::DerEncode {
                context: "certificate request (PEM)",
                source: e,
            })?;
        let fingerprint = Sha256::digest(&der)
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect();
        Ok(Self {
            subject: request.info.subject.to_string(),
            der,
            pem,
            fingerprint,
        })
    }

    pub fn der(&self) -> &[u8] {
        &self.der
    }

    pub fn pem(&self) -> &str {
        &self.pem
    }

    /// Base64 of the PEM text, as the onboarding endpoints expect it.
    pub fn pem_base64(&self) -> String {
        Base64::encode_string(self.pem.as_bytes())
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// SHA-256 hex of the DER encoding.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k256::ecdsa::signature::Verifier;
    use rand::rngs::OsRng;
    use x509_cert::der::{Decode, DecodePem};
    use x509_cert::spki::DecodePublicKey;

    fn config(category: InvoiceCategory) -> CsrConfig {
        CsrConfig::new(
            "TST-886431145-399999999900003".into(),
            "1-TST|2-TST|3-ed22f1d8-e6a2-1118-9b58-d9a8f11e445f".into(),
            "Maximum Speed Tech Supply LTD".into(),
            "399999999900003".into(),
            "Riyadh Branch".into(),
            "SA".into(),
            category,
            "RRRD2929".into(),
            "Supply activities".into(),
        )
        .expect("valid config")
    }

    #[test]
    fn rejects_bad_vat_numbers() {
        for vat in ["39999999990000", "199999999900003", "39999999990000A"] {
            let err = CsrConfig::new(
                "cn".into(),
                "1-a|2-b|3-c".into(),
                "org".into(),
                vat.into(),
                "unit".into(),
                "SA".into(),
                InvoiceCategory::Standard,
                "addr".into(),
                "cat".into(),
            )
            .expect_err("invalid vat");
            assert!(matches!(err, CsrError::Validation { .. }), "{vat}");
        }
    }

    #[test]
    fn rejects_foreign_country_and_empty_fields() {
        let foreign = CsrConfig::new(
            "cn".into(),
            "1-a|2-b|3-c".into(),
            "org".into(),
            "399999999900003".into(),
            "unit".into(),
            "AE".into(),
            InvoiceCategory::Standard,
            "addr".into(),
            "cat".into(),
        );
        assert!(foreign.is_err());

        let empty = CsrConfig::new(
            "".into(),
            "1-a|2-b|3-c".into(),
            "org".into(),
            "399999999900003".into(),
            "unit".into(),
            "SA".into(),
            InvoiceCategory::Standard,
            "addr".into(),
            "cat".into(),
        );
        assert!(matches!(empty, Err(CsrError::Validation { .. })));
    }

    #[test]
    fn builds_signed_request_with_template_and_san() {
        let signer = SigningKey::random(&mut OsRng);
        let bundle = config(InvoiceCategory::Simplified)
            .build(&signer, EnvironmentType::Simulation)
            .expect("csr");

        let parsed = CertReq::from_der(bundle.der()).expect("der");
        let from_pem = CertReq::from_pem(bundle.pem().as_bytes()).expect("pem");
        assert_eq!(parsed, from_pem);

        let subject = parsed.info.subject.to_string();
        assert!(subject.contains("CN=TST-886431145-399999999900003"));
        assert!(subject.contains("C=SA"));

        let der_text = String::from_utf8_lossy(bundle.der()).to_string();
        assert!(der_text.contains("PREZATCA-Code-Signing"));
        assert!(der_text.contains("0100"));

        let public = k256::ecdsa::VerifyingKey::from_public_key_der(
            &parsed.info.public_key.to_der().expect("spki"),
        )
        .expect("public key");
        assert_eq!(&public, signer.verifying_key());

        let signature = k256::ecdsa::DerSignature::try_from(parsed.signature.raw_bytes())
            .expect("signature");
        let info = parsed.info.to_der().expect("info");
        assert!(public.verify(&info, &signature).is_ok());
    }

    #[test]
    fn fingerprint_is_sha256_of_der() {
        let signer = SigningKey::random(&mut OsRng);
        let bundle = config(InvoiceCategory::Standard)
            .build(&signer, EnvironmentType::NonProduction)
            .expect("csr");
        assert_eq!(bundle.fingerprint().len(), 64);
        let expected: String = Sha256::digest(bundle.der())
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect();
        assert_eq!(bundle.fingerprint(), expected);
        let decoded = Base64::decode_vec(&bundle.pem_base64()).expect("b64");
        assert_eq!(decoded, bundle.pem().as_bytes());
    }

    #[test]
    fn escapes_dn_special_characters() {
        assert_eq!(escape_dn_value("Riyadh, KSA"), "Riyadh\\, KSA");
        assert_eq!(escape_dn_value("a=b+c"), "a\\=b\\+c");
        assert_eq!(escape_dn_value("#1"), "\\#1");
    }

    #[test]
    fn invoice_type_accepts_flags_and_names() {
        assert_eq!(parse_invoice_type("1000").unwrap(), InvoiceCategory::Standard);
        assert_eq!(parse_invoice_type("0100").unwrap(), InvoiceCategory::Simplified);
        assert_eq!(parse_invoice_type("simplified").unwrap(), InvoiceCategory::Simplified);
        assert!(parse_invoice_type("1100").is_err());
    }
}
