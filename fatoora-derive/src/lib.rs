//! `#[derive(Validate)]`: generates a `new` constructor that checks field rules.
//!
//! ```ignore
//! #[derive(Validate)]
//! #[validate_error(MyError)]      // MyError: From<String>; defaults to String
//! #[validate(non_empty)]          // applied to every field without its own rules
//! struct Identity {
//!     #[validate(non_empty, is_vat_number)]
//!     vat: String,
//!     #[validate(skip)]
//!     flags: u8,
//! }
//! ```
use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::{ToTokens, quote};
use syn::{Attribute, Data, DeriveInput, Fields, Type, parse_macro_input};

mod rules;

fn extract_error_type(attrs: &[Attribute]) -> syn::Result<TokenStream2> {
    for attr in attrs.iter().filter(|a| a.path().is_ident("validate_error")) {
        let mut ty = None;
        attr.parse_nested_meta(|meta| {
            ty = Some(meta.path.to_token_stream());
            Ok(())
        })?;
        if let Some(t) = ty {
            return Ok(t);
        }
    }
    Ok(quote! { ::std::string::String })
}

fn extract_rules(attrs: &[Attribute]) -> syn::Result<Vec<syn::Ident>> {
    let mut out = vec![];
    for attr in attrs.iter().filter(|a| a.path().is_ident("validate")) {
        attr.parse_nested_meta(|meta| match meta.path.get_ident() {
            Some(id) => {
                out.push(id.clone());
                Ok(())
            }
            None => Err(meta.error("expected a rule name")),
        })?;
    }
    Ok(out)
}

/// Only allow rules on String for now.
fn is_string_type(ty: &Type) -> bool {
    match ty {
        Type::Path(p) => p
            .path
            .segments
            .last()
            .map(|s| s.ident == "String")
            .unwrap_or(false),
        _ => false,
    }
}

fn expand(ast: DeriveInput) -> syn::Result<TokenStream2> {
    let struct_name = &ast.ident;
    let error_type = extract_error_type(&ast.attrs)?;
    let struct_rules = extract_rules(&ast.attrs)?;

    let fields = match &ast.data {
        Data::Struct(s) => match &s.fields {
            Fields::Named(n) => n.named.clone(),
            _ => {
                return Err(syn::Error::new_spanned(
                    &ast.ident,
                    "Validate supports structs with named fields only",
                ));
            }
        },
        _ => {
            return Err(syn::Error::new_spanned(
                &ast.ident,
                "Validate can only be used on structs",
            ));
        }
    };

    let mut ctor_params = vec![];
    let mut ctor_assigns = vec![];
    let mut validations = vec![];

    for field in fields {
        let Some(ident) = field.ident.clone() else {
            continue;
        };
        let ty = &field.ty;

        ctor_params.push(quote! { #ident: #ty });
        ctor_assigns.push(quote! { #ident });

        let mut field_rules = extract_rules(&field.attrs)?;
        if field_rules.iter().any(|r| r == "skip") {
            continue;
        }
        if field_rules.is_empty() {
            field_rules = struct_rules.clone();
        }
        if field_rules.is_empty() {
            continue;
        }

        if !is_string_type(ty) {
            return Err(syn::Error::new_spanned(
                ty,
                format!("validation rules can only be applied to String fields: {ident}"),
            ));
        }

        for rule in field_rules {
            match rules::dispatch(&rule.to_string(), &ident) {
                Some(ts) => validations.push(ts),
                None => {
                    return Err(syn::Error::new_spanned(
                        &rule,
                        format!(
                            "unknown rule `{rule}`; expected one of: {}",
                            rules::RULES.join(", ")
                        ),
                    ));
                }
            }
        }
    }

    let (impl_generics, ty_generics, where_clause) = ast.generics.split_for_impl();

    Ok(quote! {
        impl #impl_generics #struct_name #ty_generics #where_clause {
            #[allow(clippy::too_many_arguments)]
            pub fn new(
                #(#ctor_params),*
            ) -> ::std::result::Result<Self, #error_type> {
                type E = #error_type;

                #(
                    #validations
                )*

                Ok(Self {
                    #(#ctor_assigns),*
                })
            }
        }
    })
}

#[proc_macro_derive(Validate, attributes(validate, validate_error))]
pub fn derive_validate(input: TokenStream) -> TokenStream {
    let ast = parse_macro_input!(input as DeriveInput);
    expand(ast)
        .unwrap_or_else(syn::Error::into_compile_error)
        .into()
}
