use fatoora_derive::Validate;

#[derive(Validate)]
pub struct Seller {
    pub name: String,
    #[validate(is_country_code)]
    pub country: String,
}

fn main() {
    assert!(Seller::new("Maximum Speed Tech Supply".into(), "SA".into()).is_ok());
    assert!(Seller::new("Maximum Speed Tech Supply".into(), "AE".into()).is_err());
}
