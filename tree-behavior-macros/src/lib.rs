use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::{format_ident, quote};
use syn::ext::IdentExt;
use syn::{
    parse_macro_input, spanned::Spanned, Attribute, Data, DeriveInput, Fields, GenericArgument,
    Ident, LitBool, LitStr, PathArguments, Type,
};

#[proc_macro_derive(TreeModel, attributes(tree))]
pub fn derive_tree_model(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);

    match impl_tree_model(&input) {
        Ok(tokens) => tokens,
        Err(err) => err.to_compile_error().into(),
    }
}

#[derive(Default)]
struct Options {
    strategy: Option<TokenStream2>,
    id_field: Option<String>,
    id_type: Option<Type>,
    parent_field: Option<String>,
    entity_name: Option<String>,
    /// Builder calls forwarded verbatim to `TreeOptions`.
    setters: Vec<TokenStream2>,
}

/// `#[tree(key = "...")]` keys that map onto a string `TreeOptions` setter.
const STRING_SETTERS: &[(&str, &str)] = &[
    ("left", "left_column"),
    ("right", "right_column"),
    ("level", "level_column"),
    ("root", "root_column"),
    ("closure_table", "closure_table"),
    ("ancestor", "ancestor_column"),
    ("descendant", "descendant_column"),
    ("depth", "depth_column"),
    ("child_count", "child_count_column"),
    ("path", "path_column"),
    ("path_source", "path_source_column"),
    ("separator", "path_separator"),
];

/// Keys mapping onto a boolean `TreeOptions` setter.
const BOOL_SETTERS: &[(&str, &str)] = &[
    ("append_id", "path_append_id"),
    ("starts_with_separator", "path_starts_with_separator"),
    ("ends_with_separator", "path_ends_with_separator"),
];

fn impl_tree_model(input: &DeriveInput) -> syn::Result<TokenStream> {
    let struct_ident = &input.ident;

    let data_struct = match &input.data {
        Data::Struct(data) => data,
        _ => {
            return Err(syn::Error::new(
                input.span(),
                "TreeModel can only be derived for structs",
            ))
        }
    };

    let mut options = Options::default();
    let mut table_name: Option<String> = None;

    for attr in &input.attrs {
        if attr.path().is_ident("tree") {
            parse_tree_attr(attr, &mut options)?;
        }

        if attr.path().is_ident("sea_orm") {
            if let Some(name) = parse_sea_orm_table_name(attr)? {
                table_name = Some(name);
            }
        }
    }

    let strategy = options.strategy.ok_or_else(|| {
        syn::Error::new(
            struct_ident.span(),
            "`strategy` must be set in #[tree], one of \"nested_set\", \"closure\", \"materialized_path\"",
        )
    })?;

    let id_field_name = options.id_field.unwrap_or_else(|| "id".to_string());
    let parent_field_name = options
        .parent_field
        .unwrap_or_else(|| "parent_id".to_string());
    let id_field_ident = Ident::new(&id_field_name, struct_ident.span());
    let parent_field_ident = Ident::new(&parent_field_name, struct_ident.span());

    let fields = match &data_struct.fields {
        Fields::Named(fields) => &fields.named,
        _ => {
            return Err(syn::Error::new(
                data_struct.fields.span(),
                "TreeModel requires named fields",
            ))
        }
    };

    let mut id_field_type: Option<Type> = options.id_type.clone();
    let mut readers = Vec::new();
    let mut writers = Vec::new();
    for field in fields {
        let Some(ident) = &field.ident else {
            continue;
        };
        if ident == &id_field_ident && id_field_type.is_none() {
            id_field_type = Some(field.ty.clone());
        }
        if !is_tree_field_type(&field.ty) {
            continue;
        }

        let name = LitStr::new(&ident.unraw().to_string(), ident.span());
        let ty = &field.ty;
        readers.push(quote! {
            #name => ::core::option::Option::Some(::sea_orm::Value::from(self.#ident.clone())),
        });
        writers.push(quote! {
            #name => {
                active.#ident = ::sea_orm::ActiveValue::Set(
                    ::tree_behavior::__private::convert::<#ty>(field, value)?,
                );
                ::core::result::Result::Ok(())
            }
        });
    }

    let id_type = id_field_type.ok_or_else(|| {
        syn::Error::new(
            struct_ident.span(),
            "Unable to determine id field type; specify `id_type = ...` in #[tree]",
        )
    })?;

    let entity_name = options
        .entity_name
        .unwrap_or_else(|| struct_ident.unraw().to_string());
    let table = table_name.unwrap_or_else(|| struct_ident.unraw().to_string());

    let entity_name_literal = LitStr::new(&entity_name, struct_ident.span());
    let table_literal = LitStr::new(&table, struct_ident.span());
    let id_column_literal = LitStr::new(&id_field_name, struct_ident.span());
    let parent_column_literal = LitStr::new(&parent_field_name, struct_ident.span());
    let setters = &options.setters;

    let generated = quote! {
        impl ::tree_behavior::TreeModel for #struct_ident {
            type Entity = Entity;
            type ActiveModel = ActiveModel;
            type Id = #id_type;

            fn tree_config() -> ::core::result::Result<
                &'static ::tree_behavior::TreeConfig,
                ::tree_behavior::ConfigError,
            > {
                static CONFIG: ::tree_behavior::__private::Lazy<
                    ::core::result::Result<::tree_behavior::TreeConfig, ::tree_behavior::ConfigError>,
                > = ::tree_behavior::__private::Lazy::new(|| {
                    ::tree_behavior::TreeOptions::default()
                        .strategy(#strategy)
                        .id_column(#id_column_literal)
                        .parent_column(#parent_column_literal)
                        #(#setters)*
                        .build(#entity_name_literal, #table_literal)
                });
                CONFIG.as_ref().map_err(::core::clone::Clone::clone)
            }

            fn id(&self) -> Self::Id {
                self.#id_field_ident.clone()
            }

            fn parent_id(&self) -> ::core::option::Option<Self::Id> {
                self.#parent_field_ident.clone()
            }

            fn set_parent(active: &mut Self::ActiveModel, parent: ::core::option::Option<Self::Id>) {
                active.#parent_field_ident = ::sea_orm::ActiveValue::Set(parent);
            }

            fn active_id(active: &Self::ActiveModel) -> ::core::option::Option<Self::Id> {
                match &active.#id_field_ident {
                    ::sea_orm::ActiveValue::Set(id) | ::sea_orm::ActiveValue::Unchanged(id) => {
                        ::core::option::Option::Some(id.clone())
                    }
                    ::sea_orm::ActiveValue::NotSet => ::core::option::Option::None,
                }
            }

            fn active_parent(active: &Self::ActiveModel) -> ::core::option::Option<Self::Id> {
                match &active.#parent_field_ident {
                    ::sea_orm::ActiveValue::Set(parent)
                    | ::sea_orm::ActiveValue::Unchanged(parent) => parent.clone(),
                    ::sea_orm::ActiveValue::NotSet => ::core::option::Option::None,
                }
            }

            fn field_value(&self, field: &str) -> ::core::option::Option<::sea_orm::Value> {
                match field {
                    #(#readers)*
                    _ => ::core::option::Option::None,
                }
            }

            fn set_field(
                active: &mut Self::ActiveModel,
                field: &str,
                value: ::sea_orm::Value,
            ) -> ::core::result::Result<(), ::tree_behavior::TreeError> {
                match field {
                    #(#writers)*
                    _ => ::core::result::Result::Err(
                        ::tree_behavior::TreeError::UnknownField(field.to_string()),
                    ),
                }
            }
        }
    };

    Ok(generated.into())
}

fn parse_tree_attr(attr: &Attribute, options: &mut Options) -> syn::Result<()> {
    attr.parse_nested_meta(|meta| {
        let ident = meta
            .path
            .get_ident()
            .ok_or_else(|| syn::Error::new(meta.path.span(), "Invalid option key"))?
            .to_string();

        if let Some((_, setter)) = STRING_SETTERS.iter().find(|(key, _)| *key == ident) {
            let value: LitStr = meta.value()?.parse()?;
            let setter = format_ident!("{}", setter);
            options.setters.push(quote! { .#setter(#value) });
            return Ok(());
        }
        if let Some((_, setter)) = BOOL_SETTERS.iter().find(|(key, _)| *key == ident) {
            let value: LitBool = meta.value()?.parse()?;
            let setter = format_ident!("{}", setter);
            options.setters.push(quote! { .#setter(#value) });
            return Ok(());
        }

        match ident.as_str() {
            "strategy" => {
                let value: LitStr = meta.value()?.parse()?;
                let variant = match value.value().as_str() {
                    "nested_set" => quote! { NestedSet },
                    "closure" => quote! { Closure },
                    "materialized_path" => quote! { MaterializedPath },
                    other => {
                        return Err(syn::Error::new(
                            value.span(),
                            format!("Unknown tree strategy `{other}`"),
                        ))
                    }
                };
                options.strategy = Some(quote! { ::tree_behavior::StrategyKind::#variant });
            }
            "id_field" => {
                let value: LitStr = meta.value()?.parse()?;
                options.id_field = Some(value.value());
            }
            "parent_field" => {
                let value: LitStr = meta.value()?.parse()?;
                options.parent_field = Some(value.value());
            }
            "entity_name" => {
                let value: LitStr = meta.value()?.parse()?;
                options.entity_name = Some(value.value());
            }
            "id_type" => {
                let ty: Type = meta.value()?.parse()?;
                options.id_type = Some(ty);
            }
            "dependent" => {
                let value: LitStr = meta.value()?.parse()?;
                let variant = match value.value().as_str() {
                    "destroy" => quote! { Destroy },
                    "nullify" => quote! { Nullify },
                    other => {
                        return Err(syn::Error::new(
                            value.span(),
                            format!("Unknown dependent behaviour `{other}`"),
                        ))
                    }
                };
                options.setters.push(quote! {
                    .dependent_behavior(::tree_behavior::DependentBehavior::#variant)
                });
            }
            "order_column" => {
                let value: LitStr = meta.value()?.parse()?;
                options.setters.push(quote! {
                    .order_strategy(::tree_behavior::OrderStrategy::numeric_column(#value))
                });
            }
            "lock" => {
                let value: LitStr = meta.value()?.parse()?;
                if value.value() != "disabled" {
                    return Err(syn::Error::new(
                        value.span(),
                        "`lock` only accepts \"disabled\"; the namespaced lock is the default",
                    ));
                }
                options.setters.push(quote! {
                    .advisory_lock_strategy(::tree_behavior::AdvisoryLockStrategy::Disabled)
                });
            }
            other => {
                return Err(syn::Error::new(
                    meta.path.span(),
                    format!("Unsupported tree option `{other}`"),
                ));
            }
        }

        Ok(())
    })
}

fn parse_sea_orm_table_name(attr: &Attribute) -> syn::Result<Option<String>> {
    let mut table_name: Option<String> = None;
    attr.parse_nested_meta(|meta| {
        if meta.path.is_ident("table_name") {
            let value: LitStr = meta.value()?.parse()?;
            table_name = Some(value.value());
        } else if meta.input.peek(syn::Token![=]) {
            // Skip the value of unrelated `key = value` options.
            let _: syn::Expr = meta.value()?.parse()?;
        }
        Ok(())
    })?;
    Ok(table_name)
}

/// Integer and string fields, optional or not, can be read and assigned by
/// the strategies.
fn is_tree_field_type(ty: &Type) -> bool {
    let Some(segment) = last_segment(ty) else {
        return false;
    };
    if segment.ident == "Option" {
        if let PathArguments::AngleBracketed(args) = &segment.arguments {
            if let Some(GenericArgument::Type(inner)) = args.args.first() {
                return is_plain_tree_field_type(inner);
            }
        }
        return false;
    }
    is_plain_tree_field_type(ty)
}

fn is_plain_tree_field_type(ty: &Type) -> bool {
    match last_segment(ty) {
        Some(segment) if segment.arguments.is_empty() => matches!(
            segment.ident.to_string().as_str(),
            "i16" | "i32" | "i64" | "u16" | "u32" | "u64" | "String"
        ),
        _ => false,
    }
}

fn last_segment(ty: &Type) -> Option<&syn::PathSegment> {
    match ty {
        Type::Path(path) if path.qself.is_none() => path.path.segments.last(),
        _ => None,
    }
}
