use itertools::Itertools;
use proc_macro2::{Delimiter, Group, Span, TokenStream, TokenTree};
use quote::quote;
use syn::{
    LitInt, Path, Token,
    parse::{Parse, ParseStream},
};

/// Native compute types, in token order. Must agree with `dihydro::loom::num::NATIVE_TYPES`.
const NATIVE_TYPES: [&str; 4] = ["f32", "f64", "i32", "u32"];

pub struct TableInput {
    krate: Option<Path>,
    arity: LitInt,
    template: TokenStream,
}

impl Parse for TableInput {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        // optional `crate = path;` prefix
        let krate = if input.peek(Token![crate]) && input.peek2(Token![=]) {
            input.parse::<Token![crate]>()?;
            input.parse::<Token![=]>()?;
            let path = input.parse::<Path>()?;
            input.parse::<Token![;]>()?;
            Some(path)
        } else {
            None
        };
        let arity = input.parse()?;
        input.parse::<Token![,]>()?;
        let template = input.parse()?;
        Ok(Self {
            krate,
            arity,
            template,
        })
    }
}

pub fn native_dispatch_table(input: TableInput) -> syn::Result<TokenStream> {
    let TableInput {
        krate,
        arity,
        template,
    } = input;

    let n = arity.base10_parse::<usize>()?;
    if n == 0 {
        return Err(syn::Error::new(
            arity.span(),
            "a dispatch table needs at least one type",
        ));
    }

    let base_path = match krate {
        Some(path) => quote!(#path::loom::dispatch),
        None => quote!(::dihydro::loom::dispatch),
    };

    let types = NATIVE_TYPES
        .iter()
        .map(|name| syn::parse_str::<syn::Type>(name))
        .collect::<syn::Result<Vec<_>>>()?;

    // the first type varies slowest, so the index of a tuple equals its native key
    let entries: Vec<_> = (0..n)
        .map(|_| types.iter())
        .multi_cartesian_product()
        .map(|tuple| {
            let f = substitute(template.clone(), &tuple)?;
            Ok(quote! { #base_path::DispatchEntry::new(#f) })
        })
        .collect::<syn::Result<Vec<_>>>()?;

    Ok(quote! { [#(#entries),*] })
}

/// Replaces every `{TN}` group in `stream` with the `N`-th type of `tuple`.
fn substitute(stream: TokenStream, tuple: &[&syn::Type]) -> syn::Result<TokenStream> {
    stream
        .into_iter()
        .map(|tree| match tree {
            TokenTree::Group(group) => match placeholder(&group) {
                Some((index, span)) => match tuple.get(index) {
                    Some(ty) => Ok(quote!(#ty)),
                    None => Err(syn::Error::new(
                        span,
                        format!(
                            "placeholder `T{index}` exceeds the table arity {}",
                            tuple.len()
                        ),
                    )),
                },
                None => {
                    let inner = substitute(group.stream(), tuple)?;
                    let mut output = Group::new(group.delimiter(), inner);
                    output.set_span(group.span());
                    Ok(TokenStream::from(TokenTree::Group(output)))
                }
            },
            tree => Ok(TokenStream::from(tree)),
        })
        .collect()
}

/// Returns the type index if `group` is exactly `{TN}`.
fn placeholder(group: &Group) -> Option<(usize, Span)> {
    if group.delimiter() != Delimiter::Brace {
        return None;
    }
    let trees: Vec<_> = group.stream().into_iter().collect();
    match trees.as_slice() {
        [TokenTree::Ident(ident)] => {
            let name = ident.to_string();
            let index = name.strip_prefix('T')?.parse().ok()?;
            Some((index, ident.span()))
        }
        _ => None,
    }
}
