//! Which synthetic capture devices the fake media backend exposes.

#[derive(Debug, Default, Clone, PartialEq)]
pub enum FakeMedia {
    /// No capture devices at all; enumeration succeeds but is empty.
    None,
    /// One camera and one microphone.
    #[default]
    Builtin,
    /// A microphone but no camera.
    NoCamera,
    /// Two cameras and one microphone, handy for exercising device switches.
    DualCamera,
}

const NONE: &str = "<none>";
const BUILTIN: &str = "<builtin>";
const NO_CAMERA: &str = "<no-camera>";
const DUAL_CAMERA: &str = "<dual-camera>";

impl FakeMedia {
    pub fn cameras(&self) -> usize {
        match self {
            FakeMedia::None | FakeMedia::NoCamera => 0,
            FakeMedia::Builtin => 1,
            FakeMedia::DualCamera => 2,
        }
    }

    pub fn microphones(&self) -> usize {
        match self {
            FakeMedia::None => 0,
            _ => 1,
        }
    }
}

impl std::fmt::Display for FakeMedia {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FakeMedia::None => write!(f, "{NONE}"),
            FakeMedia::Builtin => write!(f, "{BUILTIN}"),
            FakeMedia::NoCamera => write!(f, "{NO_CAMERA}"),
            FakeMedia::DualCamera => write!(f, "{DUAL_CAMERA}"),
        }
    }
}

impl std::str::FromStr for FakeMedia {
    type Err = eyre::Report;

    fn from_str(input: &str) -> eyre::Result<Self> {
        match input.trim() {
            NONE | "none" => Ok(FakeMedia::None),
            BUILTIN | "builtin" => Ok(FakeMedia::Builtin),
            NO_CAMERA | "no-camera" => Ok(FakeMedia::NoCamera),
            DUAL_CAMERA | "dual-camera" => Ok(FakeMedia::DualCamera),
            other => Err(eyre::eyre!("Unknown fake media selection: {other}")),
        }
    }
}

impl serde::Serialize for FakeMedia {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for FakeMedia {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        String::deserialize(deserializer)?
            .parse()
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::FakeMedia;

    #[test]
    fn parses_both_spellings() {
        assert_eq!("<no-camera>".parse::<FakeMedia>().unwrap(), FakeMedia::NoCamera);
        assert_eq!("dual-camera".parse::<FakeMedia>().unwrap(), FakeMedia::DualCamera);
        assert!("webcam.mp4".parse::<FakeMedia>().is_err());
        assert_eq!(FakeMedia::DualCamera.cameras(), 2);
    }
}
