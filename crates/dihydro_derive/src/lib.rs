use proc_macro::TokenStream;
use syn::parse_macro_input;

mod table;

/// Builds the dense dispatch table of a kernel over the Cartesian product of native compute types.
///
/// ```ignore
/// static ZERO_CPU: LazyLock<[DispatchEntry; 4]> = LazyLock::new(|| {
///     native_dispatch_table!(1, zero_cpu::<{T0}> as fn(&Tensor<{T0}>) -> Result<(), TensorError>)
/// });
/// ```
///
/// Every `{TN}` in the template is replaced with the `N`-th type of the tuple being instantiated.
/// Entries are laid out so that the native dispatch key of a tuple is its index in the table.
#[proc_macro]
pub fn native_dispatch_table(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as table::TableInput);
    let expanded = match table::native_dispatch_table(input) {
        Ok(expanded) => expanded,
        Err(err) => err.to_compile_error(),
    };
    expanded.into()
}
