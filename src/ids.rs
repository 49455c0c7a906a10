//! Identifier types for every namespace the kernel tracks.
//!
//! Kernel-wide identifiers (`KRef`, `EndpointId`, `SubclusterId`) and
//! endpoint-local identifiers (`LocalRef`) are distinct closed sum types
//! rather than tagged strings parsed ad hoc at each call site (see the
//! "promise identity vs. presence" design note). String forms exist only
//! at the store and wire boundary, via `Display`/`FromStr`.

use core::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::KernelError;

/// A kernel object reference, `koN`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct KoId(pub u64);

/// A kernel promise reference, `kpN`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct KpId(pub u64);

/// A kernel-wide reference: either a durable object or a promise.
///
/// Objects and promises share the c-list machinery but are never confused
/// with one another because the tag lives in the type, not in a string
/// prefix re-derived at every site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum KRef {
    Object(KoId),
    Promise(KpId),
}

impl KRef {
    pub fn as_promise(self) -> Option<KpId> {
        match self {
            KRef::Promise(p) => Some(p),
            KRef::Object(_) => None,
        }
    }

    pub fn as_object(self) -> Option<KoId> {
        match self {
            KRef::Object(o) => Some(o),
            KRef::Promise(_) => None,
        }
    }
}

impl fmt::Display for KRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KRef::Object(KoId(n)) => write!(f, "ko{n}"),
            KRef::Promise(KpId(n)) => write!(f, "kp{n}"),
        }
    }
}

impl FromStr for KRef {
    type Err = KernelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(rest) = s.strip_prefix("ko") {
            let n = rest
                .parse()
                .map_err(|_| KernelError::StoreCorruption(format!("malformed kref {s}")))?;
            Ok(KRef::Object(KoId(n)))
        } else if let Some(rest) = s.strip_prefix("kp") {
            let n = rest
                .parse()
                .map_err(|_| KernelError::StoreCorruption(format!("malformed kref {s}")))?;
            Ok(KRef::Promise(KpId(n)))
        } else {
            Err(KernelError::StoreCorruption(format!("malformed kref {s}")))
        }
    }
}

/// The kind of endpoint a given `EndpointId` names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndpointKind {
    Vat,
    SystemVat,
    Remote,
}

/// A kernel-wide endpoint identifier: `vN`, `svN`, or `rN`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EndpointId {
    pub kind: EndpointKind,
    pub number: u64,
}

impl EndpointId {
    pub fn vat(number: u64) -> Self {
        Self { kind: EndpointKind::Vat, number }
    }

    pub fn system_vat(number: u64) -> Self {
        Self { kind: EndpointKind::SystemVat, number }
    }

    pub fn remote(number: u64) -> Self {
        Self { kind: EndpointKind::Remote, number }
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = match self.kind {
            EndpointKind::Vat => "v",
            EndpointKind::SystemVat => "sv",
            EndpointKind::Remote => "r",
        };
        write!(f, "{prefix}{}", self.number)
    }
}

impl FromStr for EndpointId {
    type Err = KernelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, rest) = if let Some(rest) = s.strip_prefix("sv") {
            (EndpointKind::SystemVat, rest)
        } else if let Some(rest) = s.strip_prefix("v") {
            (EndpointKind::Vat, rest)
        } else if let Some(rest) = s.strip_prefix("r") {
            (EndpointKind::Remote, rest)
        } else {
            return Err(KernelError::StoreCorruption(format!("malformed endpoint id {s}")));
        };
        let number = rest
            .parse()
            .map_err(|_| KernelError::StoreCorruption(format!("malformed endpoint id {s}")))?;
        Ok(Self { kind, number })
    }
}

/// A subcluster identifier: `sN`, or `ssN` for system subclusters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SubclusterId {
    pub number: u64,
    pub system: bool,
}

impl fmt::Display for SubclusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.system {
            write!(f, "ss{}", self.number)
        } else {
            write!(f, "s{}", self.number)
        }
    }
}

impl FromStr for SubclusterId {
    type Err = KernelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (system, rest) = if let Some(rest) = s.strip_prefix("ss") {
            (true, rest)
        } else if let Some(rest) = s.strip_prefix('s') {
            (false, rest)
        } else {
            return Err(KernelError::StoreCorruption(format!("malformed subcluster id {s}")));
        };
        let number = rest
            .parse()
            .map_err(|_| KernelError::StoreCorruption(format!("malformed subcluster id {s}")))?;
        Ok(Self { number, system })
    }
}

/// Direction of an endpoint-local reference, derived from the sign in the
/// local form (`o+5` is exported by the endpoint, `o-5` is imported).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Exported,
    Imported,
}

/// An endpoint-local reference: `o+N`/`o-N` for objects, `p+N`/`p-N` for
/// promises. The decider/subscriber role of a local promise ref follows the
/// same exported/imported sign: the decider holds `p+N`, subscribers hold
/// `p-N`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum LocalRef {
    Object { number: u64, direction: DirectionOrd },
    Promise { number: u64, direction: DirectionOrd },
}

/// `Direction` with a total order so `LocalRef` can derive `Ord`; kept as a
/// distinct type rather than deriving `Ord` on `Direction` directly so the
/// public `Direction` enum is free to grow non-ordinal variants later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DirectionOrd {
    Imported,
    Exported,
}

impl From<Direction> for DirectionOrd {
    fn from(d: Direction) -> Self {
        match d {
            Direction::Exported => DirectionOrd::Exported,
            Direction::Imported => DirectionOrd::Imported,
        }
    }
}

impl From<DirectionOrd> for Direction {
    fn from(d: DirectionOrd) -> Self {
        match d {
            DirectionOrd::Exported => Direction::Exported,
            DirectionOrd::Imported => Direction::Imported,
        }
    }
}

impl LocalRef {
    pub fn object(number: u64, direction: Direction) -> Self {
        LocalRef::Object { number, direction: direction.into() }
    }

    pub fn promise(number: u64, direction: Direction) -> Self {
        LocalRef::Promise { number, direction: direction.into() }
    }

    pub fn direction(self) -> Direction {
        match self {
            LocalRef::Object { direction, .. } => direction.into(),
            LocalRef::Promise { direction, .. } => direction.into(),
        }
    }
}

impl fmt::Display for LocalRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LocalRef::Object { number, direction } => {
                let sign = if *direction == DirectionOrd::Exported { '+' } else { '-' };
                write!(f, "o{sign}{number}")
            }
            LocalRef::Promise { number, direction } => {
                let sign = if *direction == DirectionOrd::Exported { '+' } else { '-' };
                write!(f, "p{sign}{number}")
            }
        }
    }
}

impl FromStr for LocalRef {
    type Err = KernelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut chars = s.chars();
        let tag = chars.next();
        let sign = chars.next();
        let rest: String = chars.collect();
        let number: u64 = rest
            .parse()
            .map_err(|_| KernelError::StoreCorruption(format!("malformed local ref {s}")))?;
        let direction = match sign {
            Some('+') => Direction::Exported,
            Some('-') => Direction::Imported,
            _ => return Err(KernelError::StoreCorruption(format!("malformed local ref {s}"))),
        };
        match tag {
            Some('o') => Ok(LocalRef::object(number, direction)),
            Some('p') => Ok(LocalRef::promise(number, direction)),
            _ => Err(KernelError::StoreCorruption(format!("malformed local ref {s}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kref_round_trips_through_display_and_parse() {
        let k = KRef::Object(KoId(42));
        assert_eq!(k.to_string(), "ko42");
        assert_eq!(k.to_string().parse::<KRef>().unwrap(), k);

        let p = KRef::Promise(KpId(7));
        assert_eq!(p.to_string(), "kp7");
        assert_eq!(p.to_string().parse::<KRef>().unwrap(), p);
    }

    #[test]
    fn endpoint_id_round_trips() {
        for id in [EndpointId::vat(1), EndpointId::system_vat(2), EndpointId::remote(3)] {
            assert_eq!(id.to_string().parse::<EndpointId>().unwrap(), id);
        }
    }

    #[test]
    fn subcluster_id_round_trips_system_and_user() {
        let sid = SubclusterId { number: 3, system: false };
        assert_eq!(sid.to_string(), "s3");
        assert_eq!(sid.to_string().parse::<SubclusterId>().unwrap(), sid);

        let ssid = SubclusterId { number: 1, system: true };
        assert_eq!(ssid.to_string(), "ss1");
        assert_eq!(ssid.to_string().parse::<SubclusterId>().unwrap(), ssid);
    }

    #[test]
    fn local_ref_direction_from_sign() {
        let exported: LocalRef = "o+5".parse().unwrap();
        assert_eq!(exported.direction(), Direction::Exported);
        let imported: LocalRef = "p-3".parse().unwrap();
        assert_eq!(imported.direction(), Direction::Imported);
        assert_eq!(exported.to_string(), "o+5");
        assert_eq!(imported.to_string(), "p-3");
    }
}
