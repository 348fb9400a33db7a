/// Generates an open-ended BACnet enumeration: the standard values as named
/// variants, plus `Proprietary` for values inside the vendor range and `Reserved`
/// for everything else. Unknown values therefore survive a decode/encode cycle.
///
/// # Arguments
///
/// * `$name:ident` - The name of the enum to be generated.
/// * `$variant:ident = $value:expr` - The standard variants and their wire values.
/// * `$unit:ident` - The underlying integer type (`u8`, `u16`, ...).
/// * `$range:expr` - The range reserved for vendor-proprietary values.
///
/// # Example
///
/// ```rust
/// use bacnet_stack::generate_custom_enum;
///
/// generate_custom_enum! {
///     DoorStatus {
///         Closed = 0,
///         Open = 1,
///     },
///     u8,
///     64..=255
/// }
///
/// assert_eq!(DoorStatus::from(1u8), DoorStatus::Open);
/// assert_eq!(u8::from(DoorStatus::from(200u8)), 200);
/// assert!(DoorStatus::from(200u8).is_proprietary());
/// assert!(matches!(DoorStatus::from(7u8), DoorStatus::Reserved(_)));
/// assert_eq!(DoorStatus::Closed.to_string(), "Closed");
/// ```
///
/// # Generated Code Structure
///
/// * the named variants
/// * `Proprietary([<$name Value>])` for values inside `$range`
/// * `Reserved([<$name Value>])` for values outside it
///
/// together with `Display`, `From<$name> for $unit` and `From<$unit> for $name`.
#[macro_export]
macro_rules! generate_custom_enum {
    ($(#[$doc:meta])* $name:ident { $($variant:ident = $value:expr,)+ }, $unit:ident, $custom_range:expr) => {
        pastey::paste! {
            $(#[$doc])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
            pub enum $name {
                $($variant,)*
                Proprietary( [<$name Value>] ),
                Reserved( [<$name Value>] ),
            }

            #[doc = "Raw wire value of a non-standard `" $name "`"]
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
            pub struct [<$name Value>] { value: $unit }

            impl [<$name Value>] {
                pub fn value(&self) -> $unit {
                    self.value
                }
            }

            impl $name {
                /// Whether the value lies in the vendor-proprietary range
                pub fn is_proprietary(&self) -> bool {
                    matches!(self, $name::Proprietary(_))
                }
            }

            impl ::core::fmt::Display for $name {
                fn fmt(&self, f: &mut ::core::fmt::Formatter<'_>) -> ::core::fmt::Result {
                    match self {
                        $($name::$variant => write!(f, "{}", stringify!($variant)),)*
                        $name::Proprietary(value) => write!(f, "Proprietary({})", value.value()),
                        $name::Reserved(value) => write!(f, "Reserved({})", value.value()),
                    }
                }
            }

            impl From<$name> for $unit {
                fn from(value: $name) -> Self {
                    match value {
                        $($name::$variant => $value,)*
                        $name::Proprietary(value) | $name::Reserved(value) => value.value(),
                    }
                }
            }

            impl From<$unit> for $name {
                fn from(value: $unit) -> Self {
                    match value {
                        $($value => $name::$variant,)*
                        v if ($custom_range).contains(&v) => {
                            $name::Proprietary([<$name Value>] { value: v })
                        }
                        v => $name::Reserved([<$name Value>] { value: v }),
                    }
                }
            }
        }
    };
}
