//! Attribute macros that stand in for MCP Mesh's Python decorators.
//!
//! Rust has no mechanism to monkey-patch a function reference at import
//! time, so these macros take a different route to the same end: each one
//! leaves the annotated item's signature untouched and emits an
//! `inventory::submit!` block carrying a small `fn() -> Declaration`
//! builder. The runtime's `DecoratorRegistry::discover` performs one pass
//! over the `inventory` collection at startup and copies the results into
//! an owned snapshot, matching the "decorators register metadata
//! synchronously as modules load" behavior of the original.
//!
//! `#[mesh::tool]` and `#[mesh::llm]` are applied to `async fn`s;
//! `#[mesh::agent]` is applied to a unit struct, since Rust has no "the
//! currently running module" to attach agent-wide metadata to.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::parse::{Parse, ParseStream};
use syn::punctuated::Punctuated;
use syn::{
    parse_macro_input, Error, Expr, ExprArray, Ident, ItemFn, ItemStruct, Lit, LitBool, Path,
    Result as SynResult, Token,
};

/// A single `key = value` entry inside an attribute's argument list.
struct AttrArg {
    key: Ident,
    value: Expr,
}

impl Parse for AttrArg {
    fn parse(input: ParseStream) -> SynResult<Self> {
        let key: Ident = input.parse()?;
        input.parse::<Token![=]>()?;
        let value: Expr = input.parse()?;
        Ok(Self { key, value })
    }
}

struct AttrArgs(Vec<AttrArg>);

impl Parse for AttrArgs {
    fn parse(input: ParseStream) -> SynResult<Self> {
        let parsed = Punctuated::<AttrArg, Token![,]>::parse_terminated(input)?;
        Ok(Self(parsed.into_iter().collect()))
    }
}

impl AttrArgs {
    fn get(&self, name: &str) -> Option<&Expr> {
        self.0
            .iter()
            .find(|a| a.key == name)
            .map(|a| &a.value)
    }

    fn string(&self, name: &str) -> SynResult<Option<String>> {
        match self.get(name) {
            None => Ok(None),
            Some(Expr::Lit(syn::ExprLit {
                lit: Lit::Str(s), ..
            })) => Ok(Some(s.value())),
            Some(other) => Err(Error::new_spanned(other, format!("`{name}` must be a string literal"))),
        }
    }

    fn string_required(&self, name: &str, site: proc_macro2::Span) -> SynResult<String> {
        self.string(name)?
            .ok_or_else(|| Error::new(site, format!("missing required attribute `{name}`")))
    }

    fn bool(&self, name: &str, default: bool) -> SynResult<bool> {
        match self.get(name) {
            None => Ok(default),
            Some(Expr::Lit(syn::ExprLit {
                lit: Lit::Bool(LitBool { value, .. }),
                ..
            })) => Ok(*value),
            Some(other) => Err(Error::new_spanned(other, format!("`{name}` must be a bool literal"))),
        }
    }

    fn int(&self, name: &str, default: i64) -> SynResult<i64> {
        match self.get(name) {
            None => Ok(default),
            Some(Expr::Lit(syn::ExprLit {
                lit: Lit::Int(n), ..
            })) => n.base10_parse::<i64>(),
            Some(other) => Err(Error::new_spanned(other, format!("`{name}` must be an integer literal"))),
        }
    }

    fn string_array(&self, name: &str) -> SynResult<Vec<String>> {
        match self.get(name) {
            None => Ok(vec![]),
            Some(Expr::Array(ExprArray { elems, .. })) => elems
                .iter()
                .map(|e| match e {
                    Expr::Lit(syn::ExprLit {
                        lit: Lit::Str(s), ..
                    }) => Ok(s.value()),
                    other => Err(Error::new_spanned(other, "array entries must be string literals")),
                })
                .collect(),
            Some(other) => Err(Error::new_spanned(other, format!("`{name}` must be an array of string literals"))),
        }
    }

    fn path(&self, name: &str) -> SynResult<Option<Path>> {
        match self.get(name) {
            None => Ok(None),
            Some(Expr::Path(p)) => Ok(Some(p.path.clone())),
            Some(other) => Err(Error::new_spanned(other, format!("`{name}` must be a type path"))),
        }
    }

    /// Tokens constructing a `serde_json::Value` for an argument that may be
    /// a string, a list, or a mapping - `filter` accepts all three shapes
    /// (a bare capability name, a `{capability, tags}` object, or a list of
    /// either), so unlike `string`/`string_array` this can't commit to one
    /// literal shape at parse time.
    fn json_value(&self, name: &str) -> Option<TokenStream2> {
        self.get(name).map(json_value_tokens)
    }
}

/// Rebuild an attribute expression as tokens that construct a
/// `serde_json::Value`. String and array-of-values literals are rebuilt
/// explicitly so they don't need a matching `From` impl on a Rust array
/// type; anything else (an object built via `serde_json::json!{...}`, a
/// path to a `const`, ...) is passed through `Value::from`, which is the
/// identity conversion when the expression already is a `Value`.
fn json_value_tokens(expr: &Expr) -> TokenStream2 {
    match expr {
        Expr::Array(ExprArray { elems, .. }) => {
            let items: Vec<TokenStream2> = elems.iter().map(json_value_tokens).collect();
            quote! { ::serde_json::Value::Array(vec![#(#items),*]) }
        }
        other => quote! { ::serde_json::Value::from(#other) },
    }
}

fn opt_string_tokens(value: Option<String>) -> TokenStream2 {
    match value {
        Some(s) => quote! { Some(#s.to_string()) },
        None => quote! { None },
    }
}

/// `#[mesh::tool(capability = "...", tags = [...], version = "1.0.0", dependencies = [...], description = "...")]`
#[proc_macro_attribute]
pub fn tool(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = parse_macro_input!(attr as AttrArgs);
    let func = parse_macro_input!(item as ItemFn);

    if func.sig.asyncness.is_none() {
        return Error::new_spanned(&func.sig.fn_token, "#[mesh::tool] functions must be async")
            .to_compile_error()
            .into();
    }

    let capability = match args.string("capability") {
        Ok(v) => v,
        Err(e) => return e.to_compile_error().into(),
    };
    let version = match args.string("version") {
        Ok(v) => v.unwrap_or_else(|| "1.0.0".to_string()),
        Err(e) => return e.to_compile_error().into(),
    };
    let tags = match args.string_array("tags") {
        Ok(v) => v,
        Err(e) => return e.to_compile_error().into(),
    };
    let deps = match args.string_array("dependencies") {
        Ok(v) => v,
        Err(e) => return e.to_compile_error().into(),
    };
    let description = match args.string("description") {
        Ok(v) => v,
        Err(e) => return e.to_compile_error().into(),
    };

    let fn_name = func.sig.ident.clone();
    let fn_name_str = fn_name.to_string();
    let capability_tokens = opt_string_tokens(capability);
    let description_tokens = opt_string_tokens(description);

    let expanded = quote! {
        #func

        #[doc(hidden)]
        #[allow(non_upper_case_globals)]
        const _: () = {
            ::mcp_mesh::inventory::submit! {
                ::mcp_mesh::decorator::ToolRegistration {
                    builder: || ::mcp_mesh::spec::ToolDeclaration {
                        function_id: concat!(module_path!(), "::", #fn_name_str).to_string(),
                        function_name: #fn_name_str.to_string(),
                        capability: #capability_tokens,
                        tags: vec![#(#tags.to_string()),*],
                        version: #version.to_string(),
                        dependencies: vec![
                            #(::mcp_mesh::spec::DependencySpec::new(#deps.to_string(), None, None)),*
                        ],
                        description: #description_tokens,
                        input_schema: None,
                        kwargs: ::std::collections::HashMap::new(),
                    },
                }
            }
        };
    };

    expanded.into()
}

/// `#[mesh::agent(name = "...", version = "...", http_host = "...", http_port = 0, ...)]`
#[proc_macro_attribute]
pub fn agent(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = parse_macro_input!(attr as AttrArgs);
    let item_struct = parse_macro_input!(item as ItemStruct);

    let name = match args.string_required("name", proc_macro2::Span::call_site()) {
        Ok(v) => v,
        Err(e) => return e.to_compile_error().into(),
    };
    let version = match args.string("version") {
        Ok(v) => v.unwrap_or_else(|| "1.0.0".to_string()),
        Err(e) => return e.to_compile_error().into(),
    };
    let description = match args.string("description") {
        Ok(v) => v,
        Err(e) => return e.to_compile_error().into(),
    };
    let http_host = match args.string("http_host") {
        Ok(v) => v,
        Err(e) => return e.to_compile_error().into(),
    };
    let http_port = match args.int("http_port", 0) {
        Ok(v) => v,
        Err(e) => return e.to_compile_error().into(),
    };
    let enable_http = match args.bool("enable_http", true) {
        Ok(v) => v,
        Err(e) => return e.to_compile_error().into(),
    };
    let namespace = match args.string("namespace") {
        Ok(v) => v.unwrap_or_else(|| "default".to_string()),
        Err(e) => return e.to_compile_error().into(),
    };
    let health_interval = match args.int("health_interval", 5) {
        Ok(v) => v,
        Err(e) => return e.to_compile_error().into(),
    };
    let auto_run = match args.bool("auto_run", true) {
        Ok(v) => v,
        Err(e) => return e.to_compile_error().into(),
    };
    let auto_run_interval = match args.int("auto_run_interval", 10) {
        Ok(v) => v,
        Err(e) => return e.to_compile_error().into(),
    };

    if health_interval < 1 {
        return Error::new(
            proc_macro2::Span::call_site(),
            "health_interval must be at least 1",
        )
        .to_compile_error()
        .into();
    }
    if auto_run_interval < 1 {
        return Error::new(
            proc_macro2::Span::call_site(),
            "auto_run_interval must be at least 1",
        )
        .to_compile_error()
        .into();
    }

    let http_port = http_port as u16;
    let health_interval = health_interval as u64;
    let auto_run_interval = auto_run_interval as u64;
    let description_tokens = opt_string_tokens(description);
    let http_host_tokens = opt_string_tokens(http_host);
    let struct_name = item_struct.ident.clone();

    let expanded = quote! {
        #item_struct

        #[doc(hidden)]
        #[allow(non_upper_case_globals)]
        const _: () = {
            ::mcp_mesh::inventory::submit! {
                ::mcp_mesh::decorator::AgentRegistration {
                    builder: || ::mcp_mesh::spec::AgentDeclarationInput {
                        name: #name.to_string(),
                        version: #version.to_string(),
                        description: #description_tokens,
                        http_host: #http_host_tokens,
                        http_port: #http_port,
                        enable_http: #enable_http,
                        namespace: #namespace.to_string(),
                        health_interval: #health_interval,
                        auto_run: #auto_run,
                        auto_run_interval: #auto_run_interval,
                    },
                }
            }
        };

        impl #struct_name {
            /// Marker - this type exists only to anchor `#[mesh::agent]`'s metadata.
            #[doc(hidden)]
            pub fn __mesh_agent_marker() {}
        }
    };

    expanded.into()
}

/// `#[mesh::llm(filter = "...", filter_mode = "all", provider = "...", model = "...", max_iterations = 3, output_type = SomeType, param_name = "llm")]`
///
/// `filter` accepts a bare capability string, a list (`["a", "b"]`), or any
/// expression producing a `serde_json::Value` (e.g.
/// `serde_json::json!({"capability": "weather", "tags": ["+fast"]})`), matching
/// the registry's `LlmDeclaration::filter` shape.
#[proc_macro_attribute]
pub fn llm(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = parse_macro_input!(attr as AttrArgs);
    let func = parse_macro_input!(item as ItemFn);

    if func.sig.asyncness.is_none() {
        return Error::new_spanned(&func.sig.fn_token, "#[mesh::llm] functions must be async")
            .to_compile_error()
            .into();
    }

    let filter_tokens = match args.json_value("filter") {
        Some(tokens) => quote! { Some(#tokens) },
        None => quote! { None },
    };
    let filter_mode = match args.string("filter_mode") {
        Ok(v) => v.unwrap_or_else(|| "all".to_string()),
        Err(e) => return e.to_compile_error().into(),
    };
    let provider = match args.string_required("provider", proc_macro2::Span::call_site()) {
        Ok(v) => v,
        Err(e) => return e.to_compile_error().into(),
    };
    let model = match args.string_required("model", proc_macro2::Span::call_site()) {
        Ok(v) => v,
        Err(e) => return e.to_compile_error().into(),
    };
    let max_iterations = match args.int("max_iterations", 1) {
        Ok(v) => v as u32,
        Err(e) => return e.to_compile_error().into(),
    };
    let param_name = match args.string("param_name") {
        Ok(v) => v.unwrap_or_else(|| "llm".to_string()),
        Err(e) => return e.to_compile_error().into(),
    };
    let output_type = match args.path("output_type") {
        Ok(Some(p)) => p,
        Ok(None) => {
            return Error::new(
                proc_macro2::Span::call_site(),
                "missing required attribute `output_type`",
            )
            .to_compile_error()
            .into()
        }
        Err(e) => return e.to_compile_error().into(),
    };

    let fn_name = func.sig.ident.clone();
    let fn_name_str = fn_name.to_string();

    let expanded = quote! {
        #func

        #[doc(hidden)]
        #[allow(non_upper_case_globals)]
        const _: () = {
            ::mcp_mesh::inventory::submit! {
                ::mcp_mesh::decorator::LlmRegistration {
                    builder: || ::mcp_mesh::spec::LlmDeclaration {
                        function_id: concat!(module_path!(), "::", #fn_name_str).to_string(),
                        filter: #filter_tokens,
                        filter_mode: #filter_mode.to_string(),
                        provider: #provider.to_string(),
                        model: #model.to_string(),
                        api_key: None,
                        max_iterations: #max_iterations,
                        system_prompt: None,
                        template_path: None,
                        output_type_name: stringify!(#output_type).to_string(),
                        param_name: #param_name.to_string(),
                    },
                }
            }
        };
    };

    expanded.into()
}
