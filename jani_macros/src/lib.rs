use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, DeriveInput, Ident};

/// Stamps `impl crate::protocol::WireMessage for Foo { const TYPE = MessageType::Bar; }`.
///
/// Usage: `#[derive(WireMessage)] #[wire(Bar)] struct Foo { .. }`. Saves writing the same
/// three-line `impl` by hand for every body type listed in the wire protocol's request-type
/// enum.
#[proc_macro_derive(WireMessage, attributes(wire))]
pub fn derive_wire_message(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let struct_name = input.ident.clone();
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    let tag: Option<Ident> = input.attrs.iter().find_map(|attr| {
        if attr.path().is_ident("wire") {
            attr.parse_args::<Ident>().ok()
        } else {
            None
        }
    });

    let Some(tag) = tag else {
        return syn::Error::new_spanned(struct_name, "expected #[wire(MessageTypeVariant)]")
            .to_compile_error()
            .into();
    };

    let expanded = quote! {
        impl #impl_generics crate::protocol::WireMessage for #struct_name #ty_generics #where_clause {
            const TYPE: crate::protocol::MessageType = crate::protocol::MessageType::#tag;
        }
    };

    TokenStream::from(expanded)
}
