use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::CodecKind;

/// Fixed sentinel marking a geerpc connection. Not user-overridable.
pub const MAGIC_NUMBER: u32 = 0x3bef5c;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// The plaintext handshake record sent by the client before any codec
/// framed traffic. Always encoded as a single line of JSON so the server
/// can parse it before it knows the codec.
///
/// A zero duration means unbounded.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct RpcOption {
    pub magic_number: u32,
    pub codec_type: String,
    /// Interpreted by the client side only: bounds connect + handshake.
    #[serde(with = "duration_nanos")]
    pub connect_timeout: Duration,
    /// Interpreted by the server side only: bounds each request handler.
    #[serde(with = "duration_nanos")]
    pub handle_timeout: Duration,
}

impl Default for RpcOption {
    fn default() -> Self {
        Self {
            magic_number: MAGIC_NUMBER,
            codec_type: CodecKind::Msgpack.tag().to_string(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            handle_timeout: Duration::ZERO,
        }
    }
}

/// Merge a caller-provided option with the defaults.
///
/// `None` means defaults. A caller record always gets the default magic
/// number forced back in, and an empty codec tag replaced by the default.
pub fn parse_options(opt: Option<RpcOption>) -> RpcOption {
    match opt {
        None => RpcOption::default(),
        Some(mut o) => {
            o.magic_number = MAGIC_NUMBER;
            if o.codec_type.is_empty() {
                o.codec_type = CodecKind::Msgpack.tag().to_string();
            }
            o
        }
    }
}

mod duration_nanos {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_nanos() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let nanos = u64::deserialize(d)?;
        Ok(Duration::from_nanos(nanos))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_options_default() {
        let opt = parse_options(None);
        assert_eq!(opt, RpcOption::default());
        assert_eq!(opt.magic_number, MAGIC_NUMBER);
        assert_eq!(opt.codec_type, CodecKind::Msgpack.tag());
        assert_eq!(opt.connect_timeout, DEFAULT_CONNECT_TIMEOUT);
        assert_eq!(opt.handle_timeout, Duration::ZERO);
    }

    #[test]
    fn test_parse_options_merge() {
        let opt = parse_options(Some(RpcOption {
            magic_number: 0xdead,
            codec_type: String::new(),
            connect_timeout: Duration::from_secs(1),
            handle_timeout: Duration::from_secs(2),
        }));
        // the magic number is not user-overridable
        assert_eq!(opt.magic_number, MAGIC_NUMBER);
        assert_eq!(opt.codec_type, CodecKind::Msgpack.tag());
        assert_eq!(opt.connect_timeout, Duration::from_secs(1));
        assert_eq!(opt.handle_timeout, Duration::from_secs(2));
    }

    #[test]
    fn test_option_json_line() {
        let opt = RpcOption::default();
        let line = serde_json::to_string(&opt).expect("encode");
        assert!(line.contains("MagicNumber"));
        assert!(line.contains("CodecType"));
        let back: RpcOption = serde_json::from_str(&line).expect("decode");
        assert_eq!(back, opt);
    }
}
