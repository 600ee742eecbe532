//! `#[binding(...)]` arguments

use syn::meta::ParseNestedMeta;
use syn::{Attribute, LitBool, LitStr, Token};

pub struct BindingArgs {
    pub address: LitStr,
    pub one_way: bool,
    pub auto_delete: bool,
    pub auto_ack_disabled: bool,
}

pub fn is_binding(attr: &Attribute) -> bool {
    attr.path().is_ident("binding")
}

/// `flag` or `flag = bool`
fn parse_flag(meta: &ParseNestedMeta) -> syn::Result<bool> {
    if meta.input.peek(Token![=]) {
        Ok(meta.value()?.parse::<LitBool>()?.value)
    } else {
        Ok(true)
    }
}

pub fn parse_binding(attr: &Attribute) -> syn::Result<BindingArgs> {
    let mut address = None;
    let mut one_way = false;
    let mut auto_delete = false;
    let mut auto_ack_disabled = false;

    attr.parse_nested_meta(|meta| {
        if meta.path.is_ident("address") {
            address = Some(meta.value()?.parse::<LitStr>()?);
        } else if meta.path.is_ident("one_way") {
            one_way = parse_flag(&meta)?;
        } else if meta.path.is_ident("auto_delete") {
            auto_delete = parse_flag(&meta)?;
        } else if meta.path.is_ident("auto_ack_disabled") {
            auto_ack_disabled = parse_flag(&meta)?;
        } else {
            return Err(meta.error(
                "unsupported binding argument; expected address, one_way, auto_delete or auto_ack_disabled",
            ));
        }
        Ok(())
    })?;

    let address = address
        .ok_or_else(|| syn::Error::new_spanned(attr, "binding needs `address = \"...\"`"))?;
    if address.value().is_empty() {
        return Err(syn::Error::new_spanned(&address, "binding address is empty"));
    }

    Ok(BindingArgs {
        address,
        one_way,
        auto_delete,
        auto_ack_disabled,
    })
}
