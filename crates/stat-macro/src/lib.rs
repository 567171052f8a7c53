// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

use proc_macro::TokenStream;
use quote::format_ident;
use quote::quote;
use syn::Data;
use syn::DeriveInput;
use syn::Fields;
use syn::Ident;
use syn::parse_macro_input;

/// Generate a [`fnet::sys::stat::StatProvider`] implementation given a
/// struct of named fields of type [`fnet::sys::stat::StatU64`].
///
/// ```text
/// #[derive(StatProvider)]
/// struct IpStats {
///     rx: StatU64,
///     tx: StatU64,
/// }
/// ```
///
/// This macro generates the following code based on the struct above.
///
/// ```text
/// #[derive(Clone, Debug, Default)]
/// pub struct IpStatsSnap {
///     pub rx: u64,
///     pub tx: u64,
/// }
///
/// impl StatProvider for IpStats {
///     const NUM_FIELDS: u32 = 2;
///     type Snap = IpStatsSnap;
///
///     fn new() -> Self {
///         Self { rx: StatU64::new(), tx: StatU64::new() }
///     }
///
///     fn snapshot(&self) -> Self::Snap {
///         IpStatsSnap { rx: self.rx.val(), tx: self.tx.val() }
///     }
///
///     fn visit(&self, f: &mut dyn FnMut(&'static str, u64)) {
///         f("rx", self.rx.val());
///         f("tx", self.tx.val());
///     }
/// }
/// ```
#[proc_macro_derive(StatProvider)]
pub fn derive_stat_provider(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    match expand(&input) {
        Ok(ts) => ts.into(),
        Err(e) => e.to_compile_error().into(),
    }
}

fn counter_names(input: &DeriveInput) -> syn::Result<Vec<Ident>> {
    let Data::Struct(body) = &input.data else {
        return Err(syn::Error::new_spanned(
            &input.ident,
            "StatProvider can only be derived for a struct",
        ));
    };

    match &body.fields {
        Fields::Named(named) => {
            Ok(named.named.iter().filter_map(|f| f.ident.clone()).collect())
        }

        other => Err(syn::Error::new_spanned(
            other,
            "StatProvider counters must be named fields",
        )),
    }
}

fn expand(input: &DeriveInput) -> syn::Result<proc_macro2::TokenStream> {
    let name = &input.ident;
    let counters = counter_names(input)?;
    let count = counters.len() as u32;
    let snap = format_ident!("{name}Snap");

    Ok(quote! {
        #[derive(Clone, Debug, Default, Eq, PartialEq)]
        pub struct #snap {
            #( pub #counters: u64, )*
        }

        impl ::fnet::sys::stat::StatProvider for #name {
            const NUM_FIELDS: u32 = #count;
            type Snap = #snap;

            fn new() -> Self {
                Self {
                    #( #counters: ::fnet::sys::stat::StatU64::new(), )*
                }
            }

            fn snapshot(&self) -> Self::Snap {
                #snap {
                    #( #counters: self.#counters.val(), )*
                }
            }

            fn visit(&self, f: &mut dyn FnMut(&'static str, u64)) {
                #( f(stringify!(#counters), self.#counters.val()); )*
            }
        }
    })
}
