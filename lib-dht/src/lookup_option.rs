//! Lookup thoroughness options.

/// How hard a lookup tries before returning.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum LookupOption {
    /// Reserved; behaves as [`LookupOption::Arbitrary`].
    Local,

    /// Answer from local storage when possible; only touch the network on a
    /// miss.
    Arbitrary,

    /// Return on the first network hit.
    Optimistic,

    /// Run the full iteration: the K closest nodes have all answered and no
    /// nearer candidate remains.
    #[default]
    Conservative,
}

impl LookupOption {
    /// Whether local storage satisfies this option without network traffic.
    pub fn local_first(&self) -> bool {
        matches!(self, LookupOption::Local | LookupOption::Arbitrary)
    }

    /// Whether the first remote hit ends the lookup.
    pub fn stop_on_first_hit(&self) -> bool {
        !matches!(self, LookupOption::Conservative)
    }
}
