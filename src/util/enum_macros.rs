/// Generates a BACnet enumeration whose value space is split into standard values,
/// a vendor (proprietary) range and values reserved by ASHRAE.
///
/// Reject and abort reasons, error classes and error codes all reserve part of their
/// range for vendors. Decoding never fails: a value that is not one of the named
/// variants becomes `Proprietary` when it lies in `$range` and `Reserved` otherwise,
/// and encodes back to the same number.
///
/// # Example
///
/// ```rust
/// use bacnet_tsm::proprietary_enum;
///
/// proprietary_enum! {
///     /// Reasons a gateway gives up on a transaction
///     GatewayReason {
///         Other = 0,
///         Busy = 1,
///     },
///     u8,
///     64..=255
/// }
///
/// assert_eq!(GatewayReason::from(1u8), GatewayReason::Busy);
/// assert_eq!(u8::from(GatewayReason::Busy), 1);
/// assert_eq!(GatewayReason::Busy.to_string(), "Busy");
///
/// let vendor = GatewayReason::from(200u8);
/// assert!(vendor.is_proprietary());
/// assert_eq!(vendor.to_string(), "Proprietary(200)");
/// assert_eq!(u8::from(vendor), 200);
///
/// let reserved = GatewayReason::from(12u8);
/// assert!(matches!(reserved, GatewayReason::Reserved(v) if v.value() == 12));
/// ```
#[macro_export]
macro_rules! proprietary_enum {
    ($(#[$doc:meta])* $name:ident { $($variant:ident = $value:expr,)+ }, $unit:ident, $range:expr) => {
        $crate::pastey::paste! {
            $(#[$doc])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
            pub enum $name {
                $($variant,)*
                /// Vendor defined value
                Proprietary([<$name Value>]),
                /// Value reserved for future standard use
                Reserved([<$name Value>]),
            }

            #[doc = concat!("Raw value of a [`", stringify!($name), "`] outside the named variants")]
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
            pub struct [<$name Value>]($unit);

            impl [<$name Value>] {
                pub fn value(&self) -> $unit {
                    self.0
                }
            }

            impl $name {
                pub fn is_proprietary(&self) -> bool {
                    matches!(self, $name::Proprietary(_))
                }
            }

            impl std::fmt::Display for $name {
                fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                    match self {
                        $($name::$variant => f.write_str(stringify!($variant)),)*
                        $name::Proprietary(v) => write!(f, "Proprietary({})", v.value()),
                        $name::Reserved(v) => write!(f, "Reserved({})", v.value()),
                    }
                }
            }

            impl From<$name> for $unit {
                fn from(value: $name) -> Self {
                    match value {
                        $($name::$variant => $value,)*
                        $name::Proprietary(v) | $name::Reserved(v) => v.value(),
                    }
                }
            }

            impl From<$unit> for $name {
                fn from(value: $unit) -> Self {
                    match value {
                        $($value => $name::$variant,)*
                        v if ($range).contains(&v) => $name::Proprietary([<$name Value>](v)),
                        v => $name::Reserved([<$name Value>](v)),
                    }
                }
            }
        }
    };
}
