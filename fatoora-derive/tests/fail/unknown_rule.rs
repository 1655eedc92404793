use fatoora_derive::Validate;

#[derive(Validate)]
pub struct Sample {
    #[validate(is_iban)]
    pub account: String,
}

fn main() {}
