//! `#[micro_service]` expansion

use crate::binding::{is_binding, parse_binding, BindingArgs};
use proc_macro2::TokenStream;
use quote::{quote, ToTokens};
use syn::spanned::Spanned;
use syn::{
    FnArg, GenericArgument, Ident, ImplItem, ImplItemFn, ItemImpl, LitStr, PathArguments,
    ReturnType, Type,
};

/// One bound method, as far as code generation cares.
struct BoundMethod {
    ident: Ident,
    args: BindingArgs,
    takes_context: bool,
    parameter: Type,
    returns: Type,
    is_async: bool,
}

pub fn micro_service_impl(contract: Option<LitStr>, mut input: ItemImpl) -> syn::Result<TokenStream> {
    if let Some((_, path, _)) = &input.trait_ {
        return Err(syn::Error::new_spanned(
            path,
            "#[micro_service] goes on an inherent impl block",
        ));
    }

    let contract = match contract {
        Some(contract) => contract.value(),
        None => type_name(&input.self_ty)?,
    };

    let mut methods = Vec::new();
    for item in &mut input.items {
        let ImplItem::Fn(method) = item else {
            continue;
        };
        let Some(position) = method.attrs.iter().position(is_binding) else {
            continue;
        };
        let attr = method.attrs.remove(position);
        if let Some(extra) = method.attrs.iter().find(|a| is_binding(a)) {
            return Err(syn::Error::new_spanned(
                extra,
                "a method carries at most one #[binding]",
            ));
        }
        methods.push(bound_method(method, parse_binding(&attr)?)?);
    }

    if methods.is_empty() {
        return Err(syn::Error::new_spanned(
            &input.self_ty,
            "#[micro_service] needs at least one #[binding] method",
        ));
    }

    let self_ty = &input.self_ty;
    let (impl_generics, _, where_clause) = input.generics.split_for_impl();

    let arms = methods.iter().map(dispatch_arm);
    let descriptors = methods.iter().map(descriptor);

    Ok(quote! {
        #input

        #[::mqsvc::async_trait]
        impl #impl_generics ::mqsvc::MicroService for #self_ty #where_clause {
            fn contract(&self) -> &'static str {
                #contract
            }

            async fn invoke(
                &self,
                method: &str,
                invocation: ::mqsvc::Invocation,
            ) -> ::mqsvc::Result<::mqsvc::Reply> {
                match method {
                    #(#arms)*
                    other => Err(::mqsvc::Error::method_not_found(#contract, other)),
                }
            }
        }

        impl #impl_generics ::mqsvc::MicroServiceContract for #self_ty #where_clause {
            const CONTRACT: &'static str = #contract;

            fn bindings() -> ::std::vec::Vec<::mqsvc::BindingDescriptor> {
                ::std::vec![#(#descriptors),*]
            }
        }
    })
}

fn type_name(ty: &Type) -> syn::Result<String> {
    match ty {
        Type::Path(path) => path
            .path
            .segments
            .last()
            .map(|segment| segment.ident.to_string())
            .ok_or_else(|| syn::Error::new_spanned(ty, "cannot derive a contract name")),
        _ => Err(syn::Error::new_spanned(
            ty,
            "cannot derive a contract name; use #[micro_service(contract = \"...\")]",
        )),
    }
}

fn bound_method(method: &ImplItemFn, args: BindingArgs) -> syn::Result<BoundMethod> {
    let sig = &method.sig;
    let mut inputs = sig.inputs.iter();

    match inputs.next() {
        Some(FnArg::Receiver(receiver)) if receiver.reference.is_some() && receiver.mutability.is_none() => {}
        _ => {
            return Err(syn::Error::new_spanned(
                sig,
                "bound methods take `&self`",
            ))
        }
    }

    let mut takes_context = false;
    let mut payload = Vec::new();
    for (index, input) in inputs.enumerate() {
        let FnArg::Typed(arg) = input else {
            continue;
        };
        if index == 0 && is_context(&arg.ty) {
            takes_context = true;
        } else {
            payload.push((*arg.ty).clone());
        }
    }

    let parameter = match payload.len() {
        1 => payload.remove(0),
        count => {
            return Err(syn::Error::new(
                sig.inputs.span(),
                format!(
                    "bound method `{}` takes {count} payload parameters; exactly one is supported",
                    sig.ident
                ),
            ))
        }
    };

    let returns = match &sig.output {
        ReturnType::Type(_, ty) => result_inner_type(ty),
        ReturnType::Default => None,
    }
    .ok_or_else(|| syn::Error::new_spanned(&sig.output, "bound methods return `Result<T>`"))?;

    Ok(BoundMethod {
        ident: sig.ident.clone(),
        args,
        takes_context,
        parameter,
        returns,
        is_async: sig.asyncness.is_some(),
    })
}

/// `&MessageContext`, however the path to it is spelled.
fn is_context(ty: &Type) -> bool {
    let Type::Reference(reference) = ty else {
        return false;
    };
    if reference.mutability.is_some() {
        return false;
    }
    match reference.elem.as_ref() {
        Type::Path(path) => path
            .path
            .segments
            .last()
            .is_some_and(|segment| segment.ident == "MessageContext"),
        _ => false,
    }
}

/// `T` out of `Result<T>` or `Result<T, E>`.
fn result_inner_type(ty: &Type) -> Option<Type> {
    let Type::Path(path) = ty else {
        return None;
    };
    let segment = path.path.segments.last()?;
    if segment.ident != "Result" {
        return None;
    }
    let PathArguments::AngleBracketed(args) = &segment.arguments else {
        return None;
    };
    match args.args.first()? {
        GenericArgument::Type(inner) => Some(inner.clone()),
        _ => None,
    }
}

fn dispatch_arm(method: &BoundMethod) -> TokenStream {
    let name = method.ident.to_string();
    let ident = &method.ident;
    let parameter = &method.parameter;

    let call = if method.takes_context {
        quote! { self.#ident(invocation.context(), parameter) }
    } else {
        quote! { self.#ident(parameter) }
    };
    let call = if method.is_async {
        quote! { #call.await }
    } else {
        call
    };

    quote! {
        #name => {
            let parameter: #parameter = invocation.parameter()?;
            let result = #call?;
            invocation.reply(&result)
        }
    }
}

fn descriptor(method: &BoundMethod) -> TokenStream {
    let name = method.ident.to_string();
    let address = &method.args.address;
    let one_way = method.args.one_way;
    let auto_delete = method.args.auto_delete;
    let auto_ack_disabled = method.args.auto_ack_disabled;
    let parameter = method.parameter.to_token_stream();
    let returns = method.returns.to_token_stream();

    quote! {
        ::mqsvc::BindingDescriptor::new(#name, #address)
            .one_way(#one_way)
            .auto_delete(#auto_delete)
            .auto_ack_disabled(#auto_ack_disabled)
            .parameter::<#parameter>()
            .returns::<#returns>()
    }
}
