use proc_macro::TokenStream;
use quote::{format_ident, quote};
use syn::{parse_macro_input, Attribute, Data, DeriveInput, Fields};

fn is_skipped(attrs: &[Attribute]) -> bool {
    attrs.iter().any(|x| x.path().is_ident("skip"))
}

/// Derives `kiln_utils::ObjectTraversal`, visiting every field not marked `#[skip]`.
#[proc_macro_derive(ObjectTraversal, attributes(skip))]
pub fn derive_object_traversal(token_stream: TokenStream) -> TokenStream {
    let ast = parse_macro_input!(token_stream as DeriveInput);
    let name = &ast.ident;

    let body = match &ast.data {
        Data::Struct(data) => {
            let mut traverse = vec![];
            for (idx, field) in data.fields.iter().enumerate() {
                if is_skipped(&field.attrs) {
                    continue;
                }

                match &field.ident {
                    Some(ident) => traverse.push(quote! {
                        self.#ident.traverse(walker)?;
                    }),
                    None => {
                        let idx = syn::Index::from(idx);
                        traverse.push(quote! {
                            self.#idx.traverse(walker)?;
                        })
                    }
                }
            }

            quote! { #(#traverse)* }
        }

        Data::Enum(data) => {
            let arms = data.variants.iter().map(|var| {
                let variant = &var.ident;

                match &var.fields {
                    Fields::Named(named) => {
                        let fields: Vec<_> = named
                            .named
                            .iter()
                            .filter_map(|x| x.ident.clone())
                            .collect();

                        quote! {
                            #name::#variant { #(#fields),* } => {
                                #(#fields.traverse(walker)?;)*
                            }
                        }
                    }

                    Fields::Unnamed(unnamed) => {
                        let fields: Vec<_> = (0..unnamed.unnamed.len())
                            .map(|idx| format_ident!("f{}", idx))
                            .collect();

                        quote! {
                            #name::#variant(#(#fields),*) => {
                                #(#fields.traverse(walker)?;)*
                            }
                        }
                    }

                    Fields::Unit => quote! {
                        #name::#variant => {}
                    },
                }
            });

            quote! {
                match self {
                    #(#arms),*
                }
            }
        }

        Data::Union(_) => {
            return syn::Error::new_spanned(name, "ObjectTraversal cannot be derived for unions")
                .to_compile_error()
                .into();
        }
    };

    let q = quote! {
        impl ::kiln_utils::ObjectTraversal for #name {
            fn traverse<W: ::kiln_utils::ObjectWalker>(
                &mut self,
                walker: &mut W,
            ) -> ::core::result::Result<(), W::Error> {
                #body
                ::core::result::Result::Ok(())
            }
        }
    };

    q.into()
}
