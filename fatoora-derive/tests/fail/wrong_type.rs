use fatoora_derive::Validate;

#[derive(Validate)]
#[validate(non_empty)]
pub struct Sample {
    pub name: String,
    pub count: u32,
}

fn main() {}
