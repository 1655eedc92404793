//! Builtin validation rules.
//!
//! Each rule expands to a statement that returns `Err(E::from(String))` from
//! the generated constructor when the field value is rejected. All rules
//! apply to `String` fields.

use proc_macro2::{Ident, TokenStream};
use quote::quote;

pub const RULES: &[&str] = &["non_empty", "is_country_code", "is_vat_number", "is_egs_serial"];

pub fn dispatch(rule: &str, value: &Ident) -> Option<TokenStream> {
    let name = value.to_string();
    let ts = match rule {
        "non_empty" => quote! {
            if #value.trim().is_empty() {
                return Err(E::from(format!("{} must be non-empty", #name)));
            }
        },
        // Only Saudi sellers can onboard with the authority.
        "is_country_code" => quote! {
            if !#value.trim().eq_ignore_ascii_case("SA") {
                return Err(E::from(format!("{} must be SA, got '{}'", #name, #value)));
            }
        },
        "is_vat_number" => quote! {
            {
                let v = #value.trim();
                if v.len() != 15 || !v.bytes().all(|b| b.is_ascii_digit()) || !v.starts_with('3') {
                    return Err(E::from(format!(
                        "{} must be 15 digits starting with 3, got '{}'",
                        #name, v
                    )));
                }
            }
        },
        // 1-<solution name>|2-<model>|3-<serial>
        "is_egs_serial" => quote! {
            {
                let parts: ::std::vec::Vec<&str> = #value.trim().split('|').collect();
                let well_formed = parts.len() == 3
                    && parts.iter().enumerate().all(|(i, part)| {
                        part.strip_prefix(&format!("{}-", i + 1))
                            .map(|rest| !rest.trim().is_empty())
                            .unwrap_or(false)
                    });
                if !well_formed {
                    return Err(E::from(format!(
                        "{} must look like 1-<name>|2-<model>|3-<serial>, got '{}'",
                        #name, #value
                    )));
                }
            }
        },
        _ => return None,
    };
    Some(ts)
}
