//! Normalized cache keys and key filters.
//!
//! A key is the resource kind, the tenant it is scoped to, and the request
//! parameters that select the data. Parameters live in an ordered map and
//! list values are sorted and de-duplicated on insertion, so two requests
//! that ask for the same data always build the same key regardless of the
//! order their arguments were supplied in.

use chrono::NaiveDate;
use plantwatch_core::{DeviceId, PlantId, TenantId, UserId};
use std::collections::BTreeMap;
use std::fmt;

/// A primitive parameter value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Scalar {
    Bool(bool),
    Int(i64),
    Str(String),
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{}", b),
            Self::Int(i) => write!(f, "{}", i),
            Self::Str(s) => f.write_str(s),
        }
    }
}

impl From<bool> for Scalar {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for Scalar {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for Scalar {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<u32> for Scalar {
    fn from(v: u32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<&str> for Scalar {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for Scalar {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl From<PlantId> for Scalar {
    fn from(v: PlantId) -> Self {
        Self::Int(v.get())
    }
}

impl From<DeviceId> for Scalar {
    fn from(v: DeviceId) -> Self {
        Self::Int(v.get())
    }
}

impl From<UserId> for Scalar {
    fn from(v: UserId) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<NaiveDate> for Scalar {
    fn from(v: NaiveDate) -> Self {
        Self::Str(v.format("%Y-%m-%d").to_string())
    }
}

/// A parameter value: a single primitive or a set of primitives.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ParamValue {
    One(Scalar),
    List(Vec<Scalar>),
}

impl ParamValue {
    /// Build a list value. Order and duplicates are discarded.
    pub fn list<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Scalar>,
    {
        Self::List(items.into_iter().map(Into::into).collect()).normalized()
    }

    fn normalized(self) -> Self {
        match self {
            Self::List(mut items) => {
                items.sort();
                items.dedup();
                Self::List(items)
            }
            one => one,
        }
    }

    /// True when `other` is this value or, for lists, every element of this
    /// value is contained in `other`.
    fn is_subset_of(&self, other: &ParamValue) -> bool {
        match (self, other) {
            (Self::List(wanted), Self::List(have)) => {
                wanted.iter().all(|w| have.binary_search(w).is_ok())
            }
            (a, b) => a == b,
        }
    }
}

macro_rules! single_param {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for ParamValue {
                fn from(v: $ty) -> Self {
                    Self::One(v.into())
                }
            }
        )*
    };
}

single_param!(bool, i64, i32, u32, &str, String, PlantId, DeviceId, UserId, NaiveDate);

impl From<Scalar> for ParamValue {
    fn from(v: Scalar) -> Self {
        Self::One(v)
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::One(s) => s.fmt(f),
            Self::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    item.fmt(f)?;
                }
                f.write_str("]")
            }
        }
    }
}

/// Identity of one cached request result.
///
/// Fields are private so every key goes through the normalizing builder.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    kind: String,
    tenant: Option<TenantId>,
    params: BTreeMap<String, ParamValue>,
}

impl CacheKey {
    /// A key scoped to a tenant.
    pub fn new(kind: impl Into<String>, tenant: TenantId) -> Self {
        Self {
            kind: kind.into(),
            tenant: Some(tenant),
            params: BTreeMap::new(),
        }
    }

    /// A key for data that does not belong to any tenant (the signed-in
    /// user's own record, the tenant listing).
    pub fn global(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            tenant: None,
            params: BTreeMap::new(),
        }
    }

    /// Add or replace a parameter.
    pub fn param(mut self, name: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.params.insert(name.into(), value.into().normalized());
        self
    }

    /// Add or replace a list parameter.
    pub fn param_list<I, S>(self, name: impl Into<String>, items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Scalar>,
    {
        self.param(name, ParamValue::list(items))
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn tenant(&self) -> Option<TenantId> {
        self.tenant
    }

    pub fn params(&self) -> &BTreeMap<String, ParamValue> {
        &self.params
    }

    pub fn get_param(&self, name: &str) -> Option<&ParamValue> {
        self.params.get(name)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.kind)?;
        match self.tenant {
            Some(t) => write!(f, "@{}", t)?,
            None => f.write_str("@global")?,
        }
        for (i, (name, value)) in self.params.iter().enumerate() {
            let sep = if i == 0 { '?' } else { '&' };
            write!(f, "{}{}={}", sep, name, value)?;
        }
        Ok(())
    }
}

/// Selects a set of cache keys for invalidation or removal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyFilter {
    /// Every key in the store.
    All,
    /// Exactly one key.
    Exact(CacheKey),
    /// Keys matching every given criterion. `None` criteria match anything;
    /// `params` must be contained in the key's params.
    Match {
        kind: Option<String>,
        tenant: Option<TenantId>,
        params: BTreeMap<String, ParamValue>,
    },
}

impl KeyFilter {
    pub fn exact(key: CacheKey) -> Self {
        Self::Exact(key)
    }

    /// All keys of a kind, across tenants.
    pub fn kind(kind: impl Into<String>) -> Self {
        Self::Match {
            kind: Some(kind.into()),
            tenant: None,
            params: BTreeMap::new(),
        }
    }

    /// All keys scoped to a tenant, of any kind.
    pub fn tenant(tenant: TenantId) -> Self {
        Self::Match {
            kind: None,
            tenant: Some(tenant),
            params: BTreeMap::new(),
        }
    }

    /// Narrow a `Match` filter to one tenant. Other filters are unchanged.
    pub fn in_tenant(self, tenant: TenantId) -> Self {
        match self {
            Self::Match { kind, params, .. } => Self::Match {
                kind,
                tenant: Some(tenant),
                params,
            },
            other => other,
        }
    }

    /// Narrow a `Match` filter by a parameter. Other filters are unchanged.
    pub fn with_param(self, name: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        match self {
            Self::Match {
                kind,
                tenant,
                mut params,
            } => {
                params.insert(name.into(), value.into().normalized());
                Self::Match {
                    kind,
                    tenant,
                    params,
                }
            }
            other => other,
        }
    }

    pub fn matches(&self, key: &CacheKey) -> bool {
        match self {
            Self::All => true,
            Self::Exact(exact) => exact == key,
            Self::Match {
                kind,
                tenant,
                params,
            } => {
                if kind.as_deref().is_some_and(|k| k != key.kind) {
                    return false;
                }
                if tenant.is_some() && *tenant != key.tenant {
                    return false;
                }
                params.iter().all(|(name, wanted)| {
                    key.params
                        .get(name)
                        .is_some_and(|have| wanted.is_subset_of(have))
                })
            }
        }
    }
}

impl From<CacheKey> for KeyFilter {
    fn from(key: CacheKey) -> Self {
        Self::Exact(key)
    }
}

impl fmt::Display for KeyFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str("*"),
            Self::Exact(key) => key.fmt(f),
            Self::Match {
                kind,
                tenant,
                params,
            } => {
                f.write_str(kind.as_deref().unwrap_or("*"))?;
                match tenant {
                    Some(t) => write!(f, "@{}", t)?,
                    None => f.write_str("@*")?,
                }
                for (i, (name, value)) in params.iter().enumerate() {
                    let sep = if i == 0 { '?' } else { '&' };
                    write!(f, "{}{}={}", sep, name, value)?;
                }
                Ok(())
            }
        }
    }
}
