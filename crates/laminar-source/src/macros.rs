/// Generates `FromStr` and `Display` impls for simple string enums.
///
/// `str_enum!(Enum, norm, "error message", Variant => "canonical", "alias"; ...)`
///
/// # Normalization modes
///
/// - `lowercase`: `to_lowercase().replace('-', "_")`
/// - `lowercase_udash`: `to_lowercase().replace('_', "-")`
///
/// Parse failures produce [`SourceError::Config`](crate::SourceError::Config).
macro_rules! str_enum {
    ($enum_name:ident, $norm:ident, $err_msg:literal,
        $( $variant:ident => $display:literal $(, $alias:literal)* );+ $(;)?
    ) => {
        impl std::fmt::Display for $enum_name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                let s = match self {
                    $( Self::$variant => $display, )+
                };
                f.write_str(s)
            }
        }

        impl std::str::FromStr for $enum_name {
            type Err = crate::error::SourceError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let normalized = str_enum!(@normalize $norm s);
                match normalized.as_str() {
                    $( $display $(| $alias)* => Ok(Self::$variant), )+
                    other => Err(crate::error::SourceError::Config(
                        format!("{}: '{}'", $err_msg, other),
                    )),
                }
            }
        }
    };

    (@normalize lowercase $s:ident) => { $s.trim().to_lowercase().replace('-', "_") };
    (@normalize lowercase_udash $s:ident) => { $s.trim().to_lowercase().replace('_', "-") };
}
