use std::{fmt, str::FromStr};

use anyhow::{Result, anyhow, bail};

/// A full 40-hex-digit Git commit hash, stored decoded. Abbreviated
/// hashes are rejected: the hosting API always hands out full ones,
/// and report directory names re-derive their short form from the
/// decoded bytes. Decoding goes through the same hex codec as webhook
/// signature verification.
#[derive(Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct GitHash([u8; 20]);

impl GitHash {
    /// The 7-character abbreviation used in report directory names
    /// and job summaries.
    pub fn short(&self) -> String {
        let mut s = hex::encode(&self.0[..4]);
        s.truncate(7);
        s
    }
}

impl FromStr for GitHash {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.len() != 40 {
            bail!("not a full 40-digit git commit hash: {s:?}")
        }
        let mut bytes = [0; 20];
        hex::decode_to_slice(s, &mut bytes)
            .map_err(|e| anyhow!("not a git commit hash: {s:?}: {e}"))?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for GitHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for GitHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GitHash({self})")
    }
}

impl serde::Serialize for GitHash {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for GitHash {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = <String as serde::Deserialize>::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn t_githash() -> Result<()> {
        let s = "18fdd1625c4d98526736ea8e5047a4ca818de0b4";
        let h: GitHash = s.parse()?;
        assert_eq!(h.to_string(), s);
        assert_eq!(h.short(), "18fdd16");
        assert_eq!(format!("{h:?}"), format!("GitHash({s})"));

        // the display form is lowercase, whatever came in
        let upper: GitHash = s.to_uppercase().parse()?;
        assert_eq!(upper, h);
        assert_eq!(upper.to_string(), s);

        assert!("18fdd16".parse::<GitHash>().is_err());
        assert!(
            "g8fdd1625c4d98526736ea8e5047a4ca818de0b4"
                .parse::<GitHash>()
                .is_err()
        );
        Ok(())
    }

    #[test]
    fn t_serde_string_form() -> Result<()> {
        let s = "18fdd1625c4d98526736ea8e5047a4ca818de0b4";
        let h: GitHash = s.parse()?;
        let json = serde_json::to_string(&h)?;
        assert_eq!(json, format!("\"{s}\""));
        assert_eq!(serde_json::from_str::<GitHash>(&json)?, h);
        assert!(serde_json::from_str::<GitHash>("\"deadbeef\"").is_err());
        Ok(())
    }
}
