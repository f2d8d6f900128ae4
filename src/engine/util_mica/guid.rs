use std::fmt::{Debug, Display, Formatter};
use std::path::Path;

// 128-bit content identifier. Canonical text form is exactly 32 hex chars
#[derive(Default, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Guid(u128);
impl Guid
{
    // reserved for the resource nickname table
    pub const NIL: Self = Self(0);

    pub const TEXT_LENGTH: usize = 32;

    #[inline] #[must_use]
    pub const fn from_u128(value: u128) -> Self { Self(value) }

    #[inline] #[must_use]
    pub const fn as_u128(self) -> u128 { self.0 }

    #[inline] #[must_use]
    pub const fn is_nil(self) -> bool { self.0 == 0 }

    // parse the canonical text form; anything malformed yields the nil guid
    #[must_use]
    pub fn parse(text: &str) -> Self
    {
        Self::try_parse(text).unwrap_or(Self::NIL)
    }

    #[must_use]
    pub fn try_parse(text: &str) -> Option<Self>
    {
        if text.len() != Self::TEXT_LENGTH { return None; }
        if !text.bytes().all(|b| b.is_ascii_hexdigit()) { return None; }
        u128::from_str_radix(text, 16).ok().map(Self)
    }

    // derive a guid from a file name, e.g. "<32 hex chars>.res"
    #[must_use]
    pub fn from_file_stem(path: &Path) -> Self
    {
        match path.file_stem().and_then(|stem| stem.to_str())
        {
            Some(stem) => Self::parse(stem),
            None => Self::NIL,
        }
    }
}
impl Display for Guid
{
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result
    {
        f.write_fmt(format_args!("{:032x}", self.0))
    }
}
impl Debug for Guid
{
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result { Display::fmt(self, f) }
}
