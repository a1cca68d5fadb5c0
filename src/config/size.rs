use std::{fmt::Display, io, str::FromStr};

/// 配置大小, 支持"512", "32k", "1m"等写法, 单位按1024进位
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigSize(pub u64);

const SIZE_UNIT: [&str; 5] = ["", "k", "m", "g", "t"];

fn unit_multiple(c: char) -> Option<u64> {
    match c.to_ascii_lowercase() {
        'k' => Some(1024),
        'm' => Some(1024u64.pow(2)),
        'g' => Some(1024u64.pow(3)),
        't' => Some(1024u64.pow(4)),
        _ => None,
    }
}

impl ConfigSize {
    pub fn new(size: u64) -> Self {
        Self(size)
    }

    pub fn as_usize(&self) -> usize {
        self.0 as usize
    }
}

impl From<u64> for ConfigSize {
    fn from(value: u64) -> Self {
        ConfigSize(value)
    }
}

impl From<ConfigSize> for u64 {
    fn from(value: ConfigSize) -> u64 {
        value.0
    }
}

impl FromStr for ConfigSize {
    type Err = io::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let invalid = || io::Error::new(io::ErrorKind::InvalidInput, "invalid size");
        let last = s.chars().last().ok_or_else(invalid)?;
        let (num, multi) = match unit_multiple(last) {
            Some(multi) => (&s[..s.len() - 1], multi),
            None => (s, 1),
        };
        let num = num.trim().parse::<u64>().map_err(|_| invalid())?;
        num.checked_mul(multi).map(ConfigSize).ok_or_else(invalid)
    }
}

impl Display for ConfigSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut div = self.0;
        let mut idx = 0;
        while div >= 1024 && div % 1024 == 0 && idx < SIZE_UNIT.len() - 1 {
            div /= 1024;
            idx += 1;
        }
        write!(f, "{}{}", div, SIZE_UNIT[idx])
    }
}

#[cfg(test)]
mod tests {
    use super::ConfigSize;

    macro_rules! msize {
        ($buf:expr, $equal:expr) => {{
            let config = ConfigSize::from(($buf) as u64);
            assert_eq!(&format!("{}", config), $equal);

            let config1 = $equal.parse::<ConfigSize>().unwrap();
            assert_eq!(config1, config);
        }};
    }

    #[test]
    fn test_display() {
        msize!(1000u64, "1000");
        msize!(32768u64, "32k");
        msize!(65535u64, "65535");
        msize!(256u64 * 1024, "256k");
        msize!(4u64 * 1024 * 1024, "4m");
    }

    #[test]
    fn test_parse() {
        assert_eq!("64K".parse::<ConfigSize>().unwrap(), ConfigSize(65536));
        assert!("".parse::<ConfigSize>().is_err());
        assert!("k".parse::<ConfigSize>().is_err());
    }
}
