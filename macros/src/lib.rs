//! Derive macros for the Context Bus
//!
//! This crate provides procedural macros that make an event type conform to the
//! bus's event traits. Conformance is a compile-time property: a type that does
//! not satisfy a trait simply cannot be registered or published.
//!
//! # Available Macros
//!
//! - `#[derive(ContextEvent)]` - Implements `ContextEvent` (payload is the event
//!   itself, or the field marked `#[payload]`)
//! - `#[derive(PersistenceEvent)]` - Implements `PersistenceEvent<S>` by storing the
//!   attached session in the field marked `#[session]`
//!
//! # Example
//!
//! ```ignore
//! use context_bus_core::SessionScope;
//! use context_bus_macros::{ContextEvent, PersistenceEvent};
//!
//! #[derive(ContextEvent, PersistenceEvent, Clone, Debug)]
//! struct GetUserCart {
//!     user_id: Uuid,
//!     #[session]
//!     session: Option<SessionScope<PgSession>>,
//! }
//!
//! #[derive(ContextEvent, Clone, Debug)]
//! struct PayloadCreated {
//!     #[payload]
//!     inner: CustomPayload,
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use proc_macro::TokenStream;
use quote::quote;
use syn::{Attribute, Data, DeriveInput, Field, Fields, parse_macro_input};

/// Derive macro for `ContextEvent`
///
/// By default the event is its own payload. Mark one field `#[payload]` to hand
/// handlers that field instead.
///
/// # Attributes
///
/// - `#[payload]` - Use this field as the payload
///
/// # Panics
///
/// This macro will produce a compile error (not a runtime panic) if:
/// - More than one field is marked `#[payload]`
/// - Applied to a union
#[proc_macro_derive(ContextEvent, attributes(payload))]
pub fn derive_context_event(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let name = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    let payload_fields = match &input.data {
        Data::Struct(data) => marked_fields(&data.fields, "payload"),
        Data::Enum(_) => Vec::new(),
        Data::Union(_) => {
            return syn::Error::new_spanned(
                &input,
                "#[derive(ContextEvent)] cannot be used on unions",
            )
            .to_compile_error()
            .into();
        }
    };

    let body = match payload_fields.as_slice() {
        [] => quote! {
            type Payload = Self;

            fn into_payload(self) -> Self::Payload {
                self
            }
        },
        [(index, field)] => {
            let ty = &field.ty;
            let access = field_access(*index, field);
            quote! {
                type Payload = #ty;

                fn into_payload(self) -> Self::Payload {
                    self.#access
                }
            }
        }
        [_, (_, second), ..] => {
            return syn::Error::new_spanned(
                second,
                "Only one field can be marked #[payload]",
            )
            .to_compile_error()
            .into();
        }
    };

    let expanded = quote! {
        impl #impl_generics ::context_bus_core::event::ContextEvent for #name #ty_generics #where_clause {
            #body
        }
    };

    TokenStream::from(expanded)
}

/// Derive macro for `PersistenceEvent`
///
/// The field marked `#[session]` must implement `SessionSlot` (normally
/// `Option<SessionScope<S>>`). The session type `S` is taken from that field, so
/// the generated impl is `PersistenceEvent<S>`.
///
/// # Attributes
///
/// - `#[session]` - The field that receives the attached session scope
///
/// # Panics
///
/// This macro will produce a compile error (not a runtime panic) if:
/// - Applied to a non-struct type
/// - No field, or more than one field, is marked `#[session]`
#[proc_macro_derive(PersistenceEvent, attributes(session))]
pub fn derive_persistence_event(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let name = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    let Data::Struct(data_struct) = &input.data else {
        return syn::Error::new_spanned(
            &input,
            "#[derive(PersistenceEvent)] can only be used on structs",
        )
        .to_compile_error()
        .into();
    };

    let session_fields = marked_fields(&data_struct.fields, "session");
    let (index, field) = match session_fields.as_slice() {
        [single] => *single,
        [] => {
            return syn::Error::new_spanned(
                &input,
                "#[derive(PersistenceEvent)] needs one field marked #[session]",
            )
            .to_compile_error()
            .into();
        }
        [_, (_, second), ..] => {
            return syn::Error::new_spanned(
                second,
                "Only one field can be marked #[session]",
            )
            .to_compile_error()
            .into();
        }
    };

    let ty = &field.ty;
    let access = field_access(index, field);

    let expanded = quote! {
        impl #impl_generics ::context_bus_core::event::PersistenceEvent<
            <#ty as ::context_bus_core::session::SessionSlot>::Session
        > for #name #ty_generics #where_clause {
            fn attach_session(
                &mut self,
                scope: ::context_bus_core::session::SessionScope<
                    <#ty as ::context_bus_core::session::SessionSlot>::Session
                >,
            ) {
                ::context_bus_core::session::SessionSlot::fill(&mut self.#access, scope);
            }
        }
    };

    TokenStream::from(expanded)
}

/// Fields carrying the named marker attribute, with their positions.
fn marked_fields<'a>(fields: &'a Fields, marker: &str) -> Vec<(usize, &'a Field)> {
    fields
        .iter()
        .enumerate()
        .filter(|(_, field)| has_attribute(&field.attrs, marker))
        .collect()
}

/// `self.<name>` or `self.<index>` for a field.
fn field_access(index: usize, field: &Field) -> proc_macro2::TokenStream {
    field.ident.as_ref().map_or_else(
        || {
            let index = syn::Index::from(index);
            quote! { #index }
        },
        |ident| quote! { #ident },
    )
}

/// Helper function to check if an attribute list contains a specific attribute
fn has_attribute(attrs: &[Attribute], name: &str) -> bool {
    attrs.iter().any(|attr| attr.path().is_ident(name))
}

#[cfg(test)]
mod tests {
    // Macro expansion is exercised through the tests/ directory
}
