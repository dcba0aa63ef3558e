use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, DeriveInput, LitInt, LitStr};

/// Automagically derive `Component`.
///
/// The dense component index comes from the `#[component(...)]` attribute,
/// which is written by the schema compiler (or by hand in tests):
///
/// ```ignore
/// #[derive(Component, Serialize, Deserialize)]
/// #[component(index = 3, name = "position")]
/// struct Position { x: f32, y: f32 }
/// ```
///
/// `name` defaults to the type name.
#[proc_macro_derive(Component, attributes(component))]
pub fn derive_component(input: TokenStream) -> TokenStream {
  let input = parse_macro_input!(input as DeriveInput);
  let struct_name = input.ident.clone();

  let mut index: Option<LitInt> = None;
  let mut name: Option<LitStr> = None;
  for attr in &input.attrs {
    if !attr.path().is_ident("component") {
      continue;
    }
    let res = attr.parse_nested_meta(|meta| {
      if meta.path.is_ident("index") {
        index = Some(meta.value()?.parse()?);
        Ok(())
      } else if meta.path.is_ident("name") {
        name = Some(meta.value()?.parse()?);
        Ok(())
      } else {
        Err(meta.error("only `index` and `name` can go here"))
      }
    });
    if let Err(err) = res {
      return err.to_compile_error().into();
    }
  }
  let index = match index {
    Some(it) => it,
    None => {
      return syn::Error::new_spanned(
        &input.ident,
        "deriving Component requires #[component(index = N)]",
      )
      .to_compile_error()
      .into()
    }
  };
  let name = name
    .unwrap_or_else(|| LitStr::new(&struct_name.to_string(), struct_name.span()));

  let (impl_generics, ty_generics, where_clause) =
    input.generics.split_for_impl();

  let expanded = quote! {
    impl #impl_generics ::kinship::component::Component
      for #struct_name #ty_generics #where_clause {
      fn index() -> ::kinship::component::ComponentIndex {
        ::kinship::component::ComponentIndex(#index)
      }

      fn name() -> &'static str {
        #name
      }

      fn component_index(&self) -> ::kinship::component::ComponentIndex {
        <Self as ::kinship::component::Component>::index()
      }
    }
  };

  TokenStream::from(expanded)
}

/// Automagically derive `Message`.
///
/// ```ignore
/// #[derive(Message, Clone, Serialize, Deserialize)]
/// #[message(index = 0)]
/// struct Collide { normal: [f32; 2] }
/// ```
#[proc_macro_derive(Message, attributes(message))]
pub fn derive_message(input: TokenStream) -> TokenStream {
  let input = parse_macro_input!(input as DeriveInput);
  let struct_name = input.ident.clone();

  let mut index: Option<LitInt> = None;
  for attr in &input.attrs {
    if !attr.path().is_ident("message") {
      continue;
    }
    let res = attr.parse_nested_meta(|meta| {
      if meta.path.is_ident("index") {
        index = Some(meta.value()?.parse()?);
        Ok(())
      } else {
        Err(meta.error("only `index` can go here"))
      }
    });
    if let Err(err) = res {
      return err.to_compile_error().into();
    }
  }
  let index = match index {
    Some(it) => it,
    None => {
      return syn::Error::new_spanned(
        &input.ident,
        "deriving Message requires #[message(index = N)]",
      )
      .to_compile_error()
      .into()
    }
  };

  let (impl_generics, ty_generics, where_clause) =
    input.generics.split_for_impl();

  let expanded = quote! {
    impl #impl_generics ::kinship::messages::Message
      for #struct_name #ty_generics #where_clause {
      fn index() -> ::kinship::messages::MessageIndex {
        ::kinship::messages::MessageIndex(#index)
      }

      fn message_index(&self) -> ::kinship::messages::MessageIndex {
        <Self as ::kinship::messages::Message>::index()
      }
    }
  };

  TokenStream::from(expanded)
}

/// Automagically derive `SystemMessage` (and its typed spec).
///
/// ```ignore
/// #[derive(SystemMessage, Serialize, Deserialize)]
/// #[system_message(index = 1, destination = host, multicast, returns = i64)]
/// struct QueryScore { of: String }
/// ```
///
/// `destination` is one of `local`, `host`, `all_clients`, `remote_clients`
/// and defaults to `local`; `returns` defaults to `()`.
#[proc_macro_derive(SystemMessage, attributes(system_message))]
pub fn derive_system_message(input: TokenStream) -> TokenStream {
  let input = parse_macro_input!(input as DeriveInput);
  let struct_name = input.ident.clone();

  let mut index: Option<LitInt> = None;
  let mut destination: Option<syn::Ident> = None;
  let mut multicast = false;
  let mut returns: Option<syn::Type> = None;
  for attr in &input.attrs {
    if !attr.path().is_ident("system_message") {
      continue;
    }
    let res = attr.parse_nested_meta(|meta| {
      if meta.path.is_ident("index") {
        index = Some(meta.value()?.parse()?);
        Ok(())
      } else if meta.path.is_ident("destination") {
        destination = Some(meta.value()?.parse()?);
        Ok(())
      } else if meta.path.is_ident("multicast") {
        multicast = true;
        Ok(())
      } else if meta.path.is_ident("returns") {
        returns = Some(meta.value()?.parse()?);
        Ok(())
      } else {
        Err(meta.error(
          "only `index`, `destination`, `multicast` and `returns` can go here",
        ))
      }
    });
    if let Err(err) = res {
      return err.to_compile_error().into();
    }
  }
  let index = match index {
    Some(it) => it,
    None => {
      return syn::Error::new_spanned(
        &input.ident,
        "deriving SystemMessage requires #[system_message(index = N)]",
      )
      .to_compile_error()
      .into()
    }
  };
  let destination = match destination.as_ref().map(|it| it.to_string()).as_deref()
  {
    None | Some("local") => quote!(Local),
    Some("host") => quote!(Host),
    Some("all_clients") => quote!(AllClients),
    Some("remote_clients") => quote!(RemoteClients),
    Some(_) => {
      return syn::Error::new_spanned(
        destination.unwrap(),
        "destination must be one of `local`, `host`, `all_clients`, `remote_clients`",
      )
      .to_compile_error()
      .into()
    }
  };
  let returns = returns
    .unwrap_or_else(|| syn::Type::Verbatim(quote!(())));

  let (impl_generics, ty_generics, where_clause) =
    input.generics.split_for_impl();

  let expanded = quote! {
    impl #impl_generics ::kinship::system_message::SystemMessage
      for #struct_name #ty_generics #where_clause {
      fn index() -> ::kinship::messages::MessageIndex {
        ::kinship::messages::MessageIndex(#index)
      }

      fn message_index(&self) -> ::kinship::messages::MessageIndex {
        <Self as ::kinship::system_message::SystemMessage>::index()
      }

      fn destination(&self) -> ::kinship::system_message::SystemMessageDestination {
        ::kinship::system_message::SystemMessageDestination::#destination
      }

      fn is_multicast(&self) -> bool {
        #multicast
      }
    }

    impl #impl_generics ::kinship::system_message::SystemMessageSpec
      for #struct_name #ty_generics #where_clause {
      type Return = #returns;

      const DESTINATION: ::kinship::system_message::SystemMessageDestination =
        ::kinship::system_message::SystemMessageDestination::#destination;
      const MULTICAST: bool = #multicast;
    }
  };

  TokenStream::from(expanded)
}
