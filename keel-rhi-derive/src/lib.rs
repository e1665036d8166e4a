use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, spanned::Spanned};

/// Marks a Vulkan object wrapper that is destroyed through the `ash::Device` that created it.
///
/// Injects a `pub(crate) device: ash::Device` field and implements the sealed
/// `DeviceObject` trait of the Vulkan backend. `#[DeviceObject(label = "field")]` also
/// implements `DeviceObject::label` by returning that `String` field.
#[proc_macro_attribute]
#[allow(non_snake_case)]
pub fn DeviceObject(attr: TokenStream, item: TokenStream) -> TokenStream {
    let label_field = match parse_label(attr) {
        Ok(label) => label,
        Err(err) => return err.to_compile_error().into(),
    };

    let input = parse_macro_input!(item as syn::ItemStruct);
    let ident = input.ident.clone();
    let generics = input.generics.clone();
    let (impl_generics, ty_generics, where_clause) = generics.split_for_impl();

    let mut output_struct = input.clone();

    let syn::Fields::Named(fields_named) = &mut output_struct.fields else {
        return syn::Error::new(
            output_struct.span(),
            "DeviceObject only supports structs with named fields",
        )
        .to_compile_error()
        .into();
    };

    if fields_named.named.iter().any(|f| f.ident.as_ref().is_some_and(|id| id == "device")) {
        return syn::Error::new(
            fields_named.span(),
            "DeviceObject: struct already has a `device` field; the macro injects `pub(crate) device: ash::Device`",
        )
        .to_compile_error()
        .into();
    }

    if let Some(label) = &label_field {
        let known = fields_named
            .named
            .iter()
            .any(|f| f.ident.as_ref().is_some_and(|id| id == label));
        if !known {
            return syn::Error::new(
                label.span(),
                format!("DeviceObject: no field named `{label}` to use as label"),
            )
            .to_compile_error()
            .into();
        }
    }

    let device_field: syn::Field = syn::parse_quote! {
        pub(crate) device: ::ash::Device
    };
    fields_named.named.push(device_field);

    let label_impl = label_field.map(|label| {
        quote! {
            #[inline]
            fn label(&self) -> &str { &self.#label }
        }
    });

    let expanded = quote! {
        #output_struct

        impl #impl_generics crate::vulkan::device::sealed::Sealed for #ident #ty_generics #where_clause {}

        impl #impl_generics crate::vulkan::device::DeviceObject for #ident #ty_generics #where_clause {
            #[inline]
            fn device(&self) -> &::ash::Device { &self.device }

            #label_impl
        }
    };

    expanded.into()
}

fn parse_label(attr: TokenStream) -> syn::Result<Option<syn::Ident>> {
    if attr.is_empty() {
        return Ok(None);
    }

    let meta: syn::MetaNameValue = syn::parse(attr)?;
    if !meta.path.is_ident("label") {
        return Err(syn::Error::new(meta.path.span(), "DeviceObject: expected `label = \"field\"`"));
    }

    match meta.value {
        syn::Expr::Lit(syn::ExprLit { lit: syn::Lit::Str(name), .. }) => {
            Ok(Some(syn::Ident::new(&name.value(), name.span())))
        }
        other => Err(syn::Error::new(other.span(), "DeviceObject: label must be a string literal")),
    }
}
