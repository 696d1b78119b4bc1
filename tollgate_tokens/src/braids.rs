use aliri_braid::braid;
use std::fmt;

/// Implements `Debug` and `Display` for a secret-bearing borrowed braid
///
/// Both print `<redacted {label}>` by default. `{:#?}` shows at most `peek`
/// leading characters (or the formatter width, if given) and `{:#}` shows the
/// whole value.
macro_rules! redacted {
    ($ty:ty: $label:literal, peek = $peek:literal) => {
        impl fmt::Debug for $ty {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                if f.alternate() {
                    let peek = f.width().unwrap_or($peek);
                    write!(f, "{:?}", Peek(&self.0, peek))
                } else {
                    f.write_str(concat!("<redacted ", $label, ">"))
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                if f.alternate() {
                    f.write_str(&self.0)
                } else {
                    f.write_str(concat!("<redacted ", $label, ">"))
                }
            }
        }
    };
}

/// The first `.1` characters of a secret, quoted, with an ellipsis if cut short
struct Peek<'a>(&'a str, usize);

impl fmt::Debug for Peek<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let Peek(secret, peek) = *self;
        let cut = secret.char_indices().nth(peek).map(|(idx, _)| idx);

        f.write_str("\"")?;
        match cut {
            Some(idx) => {
                f.write_str(&secret[..idx])?;
                f.write_str("…")?;
            }
            None => f.write_str(secret)?,
        }
        f.write_str("\"")
    }
}

/// A client ID
#[braid(serde)]
pub struct ClientId;

/// A client secret
#[braid(serde, debug = "owned", display = "owned")]
pub struct ClientSecret;

redacted!(ClientSecretRef: "client secret", peek = 4);

/// An access token, or any other opaque credential value presented to a server
#[braid(serde, debug = "owned", display = "owned")]
pub struct AccessToken;

redacted!(AccessTokenRef: "access token", peek = 12);

/// The scope granted alongside a credential
#[braid(serde)]
pub struct Scope;
