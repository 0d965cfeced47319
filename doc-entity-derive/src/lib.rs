use proc_macro::TokenStream;
use quote::quote;
use syn::{Data, DeriveInput, Fields, LitStr, parse_macro_input};

/// Derives `doc_entity::Model` and `doc_entity::Field` for a struct with
/// named fields.
///
/// Container attributes: `#[model(collection = "users")]` also derives
/// `doc_entity::Collection`; `#[model(rename_all = "camelCase")]` renames
/// every field. A field takes `#[model(rename = "type")]`.
#[proc_macro_derive(Model, attributes(model))]
pub fn derive_model(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    expand(input)
        .unwrap_or_else(syn::Error::into_compile_error)
        .into()
}

#[derive(Default)]
struct ContainerAttrs {
    collection: Option<LitStr>,
    camel_case: bool,
}

fn container_attrs(input: &DeriveInput) -> syn::Result<ContainerAttrs> {
    let mut attrs = ContainerAttrs::default();
    for attr in input.attrs.iter().filter(|attr| attr.path().is_ident("model")) {
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("collection") {
                attrs.collection = Some(meta.value()?.parse()?);
                Ok(())
            } else if meta.path.is_ident("rename_all") {
                let rule: LitStr = meta.value()?.parse()?;
                match rule.value().as_str() {
                    "camelCase" => attrs.camel_case = true,
                    "snake_case" => attrs.camel_case = false,
                    _ => return Err(meta.error("supported rename_all rules: camelCase, snake_case")),
                }
                Ok(())
            } else {
                Err(meta.error("unknown model attribute"))
            }
        })?;
    }
    Ok(attrs)
}

fn field_rename(field: &syn::Field) -> syn::Result<Option<String>> {
    let mut rename = None;
    for attr in field.attrs.iter().filter(|attr| attr.path().is_ident("model")) {
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("rename") {
                let name: LitStr = meta.value()?.parse()?;
                rename = Some(name.value());
                Ok(())
            } else {
                Err(meta.error("unknown model field attribute"))
            }
        })?;
    }
    Ok(rename)
}

fn camel_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper = false;
    for c in name.trim_start_matches("r#").chars() {
        if c == '_' {
            upper = !out.is_empty();
        } else if upper {
            out.extend(c.to_uppercase());
            upper = false;
        } else {
            out.push(c);
        }
    }
    out
}

fn expand(input: DeriveInput) -> syn::Result<proc_macro2::TokenStream> {
    let attrs = container_attrs(&input)?;
    let struct_name = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    let Data::Struct(data) = &input.data else {
        return Err(syn::Error::new_spanned(&input, "Model can only be derived for structs"));
    };
    let Fields::Named(fields) = &data.fields else {
        return Err(syn::Error::new_spanned(&input, "Model needs named fields"));
    };

    let mut specs = Vec::new();
    let mut writes = Vec::new();
    let mut reads = Vec::new();
    for field in &fields.named {
        let Some(ident) = field.ident.as_ref() else {
            continue;
        };
        let ty = &field.ty;
        let name = match field_rename(field)? {
            Some(name) => name,
            None if attrs.camel_case => camel_case(&ident.to_string()),
            None => ident.to_string().trim_start_matches("r#").to_string(),
        };

        specs.push(quote! {
            ::doc_entity::FieldSpec::new(
                #name,
                <#ty as ::doc_entity::Field>::field_type(),
                <#ty as ::doc_entity::Field>::REQUIRED,
            )
        });
        writes.push(quote! {
            if let Some(value) = ::doc_entity::Field::to_value(&self.#ident) {
                doc.insert(#name, value);
            }
        });
        reads.push(quote! {
            #ident: <#ty as ::doc_entity::Field>::from_value(doc.get(#name), #name)?
        });
    }

    let collection_impl = attrs.collection.map(|collection| {
        quote! {
            impl #impl_generics ::doc_entity::Collection for #struct_name #ty_generics #where_clause {
                fn collection_name() -> &'static str {
                    #collection
                }
            }
        }
    });

    Ok(quote! {
        impl #impl_generics ::doc_entity::Model for #struct_name #ty_generics #where_clause {
            fn schema() -> ::doc_entity::Schema {
                ::doc_entity::Schema::new(vec![#(#specs),*])
            }

            fn to_document(&self) -> ::doc_entity::Document {
                let mut doc = ::doc_entity::Document::new();
                #(#writes)*
                doc
            }

            fn from_document(doc: &::doc_entity::Document) -> Result<Self, ::doc_entity::Error> {
                Ok(Self {
                    #(#reads),*
                })
            }
        }

        impl #impl_generics ::doc_entity::Field for #struct_name #ty_generics #where_clause {
            fn field_type() -> ::doc_entity::FieldType {
                ::doc_entity::FieldType::Object(<Self as ::doc_entity::Model>::schema())
            }

            fn to_value(&self) -> Option<::doc_entity::Value> {
                Some(::doc_entity::Value::Document(
                    <Self as ::doc_entity::Model>::to_document(self),
                ))
            }

            fn from_value(
                value: Option<&::doc_entity::Value>,
                path: &str,
            ) -> Result<Self, ::doc_entity::Error> {
                match value {
                    Some(::doc_entity::Value::Document(doc)) => {
                        <Self as ::doc_entity::Model>::from_document(doc)
                    }
                    Some(other) => Err(::doc_entity::Error::Decode {
                        path: path.to_string(),
                        message: format!("expected document, found {}", other.type_name()),
                    }),
                    None => Err(::doc_entity::Error::Decode {
                        path: path.to_string(),
                        message: "missing required field".to_string(),
                    }),
                }
            }
        }

        #collection_impl
    })
}
