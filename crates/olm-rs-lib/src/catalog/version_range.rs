use std::sync::OnceLock;

use semver::Version;
use serde::{Serialize, Deserialize};

/// One end of a [`VersionBounds`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Limit {
	pub version: Version,
	pub inclusive: bool,
}

impl Limit {
	fn inclusive(version: Version) -> Self { Self { version, inclusive: true } }
	fn exclusive(version: Version) -> Self { Self { version, inclusive: false } }

	/// The stricter of two lower limits.
	fn tighter_min(self, other: Self) -> Self {
		match self.version.cmp(&other.version) {
			std::cmp::Ordering::Greater => self,
			std::cmp::Ordering::Less => other,
			std::cmp::Ordering::Equal => Limit { version: self.version, inclusive: self.inclusive && other.inclusive },
		}
	}

	/// The stricter of two upper limits.
	fn tighter_max(self, other: Self) -> Self {
		match self.version.cmp(&other.version) {
			std::cmp::Ordering::Less => self,
			std::cmp::Ordering::Greater => other,
			std::cmp::Ordering::Equal => Limit { version: self.version, inclusive: self.inclusive && other.inclusive },
		}
	}
}

/// A contiguous range of versions.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub enum VersionBounds {
	#[default] Any,
	Explicit(Version),
	MinOnly(Limit),
	MaxOnly(Limit),
	MinMax(Limit, Limit),
}

impl VersionBounds {
	pub fn is_version_within(&self, other: &Version) -> bool {
		fn above(min: &Limit, v: &Version) -> bool {
			if min.inclusive { v >= &min.version } else { v > &min.version }
		}
		fn below(max: &Limit, v: &Version) -> bool {
			if max.inclusive { v <= &max.version } else { v < &max.version }
		}

		match self {
			VersionBounds::Any => true,
			VersionBounds::Explicit(v) => other == v,
			VersionBounds::MinOnly(min) => above(min, other),
			VersionBounds::MaxOnly(max) => below(max, other),
			VersionBounds::MinMax(min, max) => above(min, other) && below(max, other),
		}
	}

	/// Gets the intersection between the bounds, if no intersection exists returns `None`
	pub fn inner_join(&self, other: &Self) -> Option<Self> {
		let lhs = self.clone();
		let rhs = other.clone();

		let joined = match (lhs, rhs) {
			(VersionBounds::Any, r) => r,
			(l, VersionBounds::Any) => l,

			(VersionBounds::Explicit(a), b) | (b, VersionBounds::Explicit(a)) => {
				return b.is_version_within(&a).then_some(VersionBounds::Explicit(a))
			},

			(VersionBounds::MinOnly(a), VersionBounds::MinOnly(b)) => VersionBounds::MinOnly(a.tighter_min(b)),
			(VersionBounds::MaxOnly(a), VersionBounds::MaxOnly(b)) => VersionBounds::MaxOnly(a.tighter_max(b)),

			(VersionBounds::MinOnly(a), VersionBounds::MaxOnly(b)) | (VersionBounds::MaxOnly(b), VersionBounds::MinOnly(a)) => VersionBounds::MinMax(a, b),

			(VersionBounds::MinOnly(a), VersionBounds::MinMax(b, c)) | (VersionBounds::MinMax(b, c), VersionBounds::MinOnly(a)) => VersionBounds::MinMax(a.tighter_min(b), c),
			(VersionBounds::MaxOnly(a), VersionBounds::MinMax(b, c)) | (VersionBounds::MinMax(b, c), VersionBounds::MaxOnly(a)) => VersionBounds::MinMax(b, a.tighter_max(c)),

			(VersionBounds::MinMax(a, b), VersionBounds::MinMax(c, d)) => VersionBounds::MinMax(a.tighter_min(c), b.tighter_max(d)),
		};

		/* An empty range is not an intersection */
		if let VersionBounds::MinMax(min, max) = &joined {
			let empty = match min.version.cmp(&max.version) {
				std::cmp::Ordering::Greater => true,
				std::cmp::Ordering::Equal => !(min.inclusive && max.inclusive),
				std::cmp::Ordering::Less => false,
			};
			if empty {
				return None
			}
		}
		Some(joined)
	}
}

/// A `skipRange` expression such as `>=1.0.0 <1.3.0`.
///
/// Comparators separated by whitespace must all hold, `||` separates alternatives.
/// A missing operator means `=`, a leading `v` on the version is tolerated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionRange {
	raw: String,
	alternatives: Vec<VersionBounds>,
}

fn comparator_regex() -> &'static regex::Regex {
	static RE: OnceLock<regex::Regex> = OnceLock::new();
	RE.get_or_init(|| regex::Regex::new(r"^(>=|<=|>|<|==|=)?v?(\d+\.\d+\.\d+(?:[-+][0-9A-Za-z.+-]*)?)$").expect("comparator regex is valid"))
}

impl VersionRange {
	pub fn parse(raw: &str) -> crate::Result<Self> {
		let mut alternatives = Vec::<VersionBounds>::new();

		for alternative in raw.split("||") {
			let mut bounds = VersionBounds::Any;
			let mut tokens = alternative.split_whitespace().peekable();
			if tokens.peek().is_none() {
				return Err(crate::Error::Parse(format!("empty alternative in version range \"{}\"", raw)))
			}

			while let Some(token) = tokens.next() {
				/* Allow a space between the operator and the version, `>= 1.0.0` */
				let joined;
				let token = if matches!(token, ">=" | "<=" | ">" | "<" | "=" | "==") {
					let version = tokens.next().ok_or_else(|| crate::Error::Parse(format!("operator without version in \"{}\"", raw)))?;
					joined = format!("{}{}", token, version);
					joined.as_str()
				} else {
					token
				};

				let captures = comparator_regex().captures(token).ok_or_else(|| crate::Error::Parse(format!("invalid comparator \"{}\" in version range \"{}\"", token, raw)))?;
				let version = Version::parse(&captures[2]).map_err(|e| crate::Error::Parse(format!("invalid version in \"{}\": {}", token, e)))?;
				let comparator = match captures.get(1).map(|m| m.as_str()) {
					Some(">=") => VersionBounds::MinOnly(Limit::inclusive(version)),
					Some(">") => VersionBounds::MinOnly(Limit::exclusive(version)),
					Some("<=") => VersionBounds::MaxOnly(Limit::inclusive(version)),
					Some("<") => VersionBounds::MaxOnly(Limit::exclusive(version)),
					_ => VersionBounds::Explicit(version),
				};

				/* An unsatisfiable conjunction still parses, it just never matches */
				bounds = match bounds.inner_join(&comparator) {
					Some(b) => b,
					None => {
						log::debug!("Version range \"{}\" contains an empty alternative", raw);
						VersionBounds::MinMax(Limit::exclusive(Version::new(0, 0, 0)), Limit::exclusive(Version::new(0, 0, 0)))
					},
				};
			}
			alternatives.push(bounds);
		}

		Ok(Self { raw: raw.trim().to_string(), alternatives })
	}

	pub fn contains(&self, version: &Version) -> bool {
		self.alternatives.iter().any(|b| b.is_version_within(version))
	}

	pub fn as_str(&self) -> &str {
		&self.raw
	}
}

impl std::str::FromStr for VersionRange {
	type Err = crate::Error;
	fn from_str(s: &str) -> Result<Self, Self::Err> { Self::parse(s) }
}

impl std::fmt::Display for VersionRange {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(&self.raw)
	}
}

impl Serialize for VersionRange {
	fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_str(&self.raw)
	}
}

impl<'de> Deserialize<'de> for VersionRange {
	fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
		let raw = String::deserialize(deserializer)?;
		VersionRange::parse(&raw).map_err(serde::de::Error::custom)
	}
}
