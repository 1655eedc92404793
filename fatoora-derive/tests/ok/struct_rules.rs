use fatoora_derive::Validate;

#[derive(Debug)]
pub struct IdentityError(String);

impl From<String> for IdentityError {
    fn from(message: String) -> Self {
        IdentityError(message)
    }
}

#[derive(Validate)]
#[validate_error(IdentityError)]
#[validate(non_empty)]
pub struct Identity {
    pub common_name: String,
    #[validate(non_empty, is_vat_number)]
    pub vat_number: String,
    #[validate(is_egs_serial)]
    pub serial_number: String,
}

fn main() {
    let ok = Identity::new(
        "TST-886431145-399999999900003".into(),
        "399999999900003".into(),
        "1-TST|2-TST|3-ed22f1d8-e6a2-1118-9b58-d9a8f11e445f".into(),
    );
    assert!(ok.is_ok());

    let empty = Identity::new(" ".into(), "399999999900003".into(), "1-a|2-b|3-c".into());
    assert!(empty.is_err());

    let bad_vat = Identity::new("cn".into(), "199999999900003".into(), "1-a|2-b|3-c".into());
    let IdentityError(message) = bad_vat.err().expect("rejected");
    assert!(message.contains("vat_number"));

    let bad_serial = Identity::new("cn".into(), "399999999900003".into(), "1-a|3-c".into());
    assert!(bad_serial.is_err());
}
