use proc_macro::TokenStream;

use quote::quote;
use syn::{
    Attribute, Expr, ExprLit, ItemStruct, Lit, Meta, Token, parse::Parser, spanned::Spanned,
};

/// Stamps pipeline identity onto a step struct.
///
/// ```ignore
/// #[Step(id = "image.map", label = "Map image partitions", privileged = true)]
/// #[derive(Debug, Default)]
/// pub struct MapImageStep { .. }
/// ```
///
/// Generates `ID`/`LABEL`/`PRIVILEGED` associated consts and an implementation of
/// `crate::pipeline::StepInfo`. Runtime behavior still comes from a hand-written
/// `impl crate::pipeline::Step`.
#[proc_macro_attribute]
#[allow(non_snake_case)]
pub fn Step(attr: TokenStream, item: TokenStream) -> TokenStream {
    match step_impl(attr, item) {
        Ok(ts) => ts,
        Err(e) => e.to_compile_error().into(),
    }
}

fn lit_str(expr: &Expr) -> syn::Result<String> {
    match expr {
        Expr::Lit(ExprLit {
            lit: Lit::Str(s), ..
        }) => Ok(s.value()),
        _ => Err(syn::Error::new(expr.span(), "expected string literal")),
    }
}

fn lit_bool(expr: &Expr) -> syn::Result<bool> {
    match expr {
        Expr::Lit(ExprLit {
            lit: Lit::Bool(b), ..
        }) => Ok(b.value),
        _ => Err(syn::Error::new(expr.span(), "expected bool literal")),
    }
}

fn drop_our_attrs(attrs: &[Attribute]) -> Vec<Attribute> {
    attrs
        .iter()
        .filter(|a| {
            let Meta::Path(p) = &a.meta else {
                return true;
            };
            let Some(ident) = p.get_ident() else {
                return true;
            };
            ident != "Step"
        })
        .cloned()
        .collect()
}

// Step ids read as "<area>.<action>", e.g. "image.map" or "chroot.provision".
fn validate_id(id: &str, span: proc_macro2::Span) -> syn::Result<()> {
    let Some((area, action)) = id.split_once('.') else {
        return Err(syn::Error::new(
            span,
            format!("Step: id '{id}' must look like '<area>.<action>'"),
        ));
    };
    let ok_seg = |s: &str| {
        !s.is_empty()
            && s
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    };
    if !ok_seg(area) || !ok_seg(action) {
        return Err(syn::Error::new(
            span,
            format!("Step: id '{id}' may only use [a-z0-9_] segments"),
        ));
    }
    Ok(())
}

fn step_impl(attr: TokenStream, item: TokenStream) -> syn::Result<TokenStream> {
    let mut st: ItemStruct = syn::parse(item)?;
    st.attrs = drop_our_attrs(&st.attrs);
    let struct_ident = st.ident.clone();
    let (impl_generics, ty_generics, where_clause) = st.generics.split_for_impl();

    let parser = syn::punctuated::Punctuated::<Meta, Token![,]>::parse_terminated;
    let metas = parser.parse(attr)?;

    let mut id: Option<String> = None;
    let mut label: Option<String> = None;
    let mut privileged = false;

    for m in metas {
        let Meta::NameValue(nv) = m else {
            return Err(syn::Error::new(m.span(), "expected key = value"));
        };
        let Some(key) = nv.path.get_ident().map(|i| i.to_string()) else {
            return Err(syn::Error::new(nv.path.span(), "expected ident key"));
        };
        let v = &nv.value;
        match key.as_str() {
            "id" => {
                let s = lit_str(v)?;
                validate_id(&s, v.span())?;
                id = Some(s);
            }
            "label" => label = Some(lit_str(v)?),
            "privileged" => privileged = lit_bool(v)?,
            other => {
                return Err(syn::Error::new(
                    nv.path.span(),
                    format!("unknown Step attribute key '{other}'"),
                ));
            }
        }
    }

    let id_lit = id.ok_or_else(|| syn::Error::new(struct_ident.span(), "Step: missing id"))?;
    let label_lit =
        label.ok_or_else(|| syn::Error::new(struct_ident.span(), "Step: missing label"))?;

    let expanded = quote! {
        #st

        impl #impl_generics #struct_ident #ty_generics #where_clause {
            pub const ID: &'static str = #id_lit;
            pub const LABEL: &'static str = #label_lit;
            pub const PRIVILEGED: bool = #privileged;
        }

        impl #impl_generics crate::pipeline::StepInfo for #struct_ident #ty_generics #where_clause {
            fn id(&self) -> &'static str {
                #id_lit
            }

            fn label(&self) -> &'static str {
                #label_lit
            }

            fn privileged(&self) -> bool {
                #privileged
            }
        }
    };

    Ok(expanded.into())
}
