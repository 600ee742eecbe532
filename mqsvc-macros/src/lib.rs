//! Procedural macros for mqsvc - micro-service binding declarations

use proc_macro::TokenStream;
use syn::{parse_macro_input, ItemImpl};

mod binding;
mod service;

/// Turn an inherent impl block into a micro-service.
///
/// Every method marked `#[binding(address = "...")]` becomes a binding of
/// the contract. Flags: `one_way`, `auto_delete`, `auto_ack_disabled`, each
/// either bare or `= true/false`. A bound method takes `&self`, optionally
/// a `&MessageContext`, exactly one payload parameter, and returns
/// `Result<T>`; it may be `async` or not.
///
/// ```rust,ignore
/// #[micro_service(contract = "HelperMicroService")]
/// impl Helper {
///     #[binding(address = "topic://ex/key/queue", one_way)]
///     async fn invoke1(&self, body: Bytes) -> Result<()> {
///         Ok(())
///     }
/// }
/// ```
///
/// Generates `MicroService` (a `match` over method names) and
/// `MicroServiceContract` (the binding descriptors). The contract name
/// defaults to the type name.
#[proc_macro_attribute]
pub fn micro_service(args: TokenStream, input: TokenStream) -> TokenStream {
    let mut contract = None;
    let parser = syn::meta::parser(|meta| {
        if meta.path.is_ident("contract") {
            contract = Some(meta.value()?.parse::<syn::LitStr>()?);
            Ok(())
        } else {
            Err(meta.error("expected `contract = \"...\"`"))
        }
    });
    parse_macro_input!(args with parser);

    let input = parse_macro_input!(input as ItemImpl);
    service::micro_service_impl(contract, input)
        .unwrap_or_else(syn::Error::into_compile_error)
        .into()
}
