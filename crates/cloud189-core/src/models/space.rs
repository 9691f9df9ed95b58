use serde::{Deserialize, Serialize};

/// Storage quota from `getUserInfo.action`, in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Space {
    #[serde(default)]
    pub capacity: u64,
    #[serde(default)]
    pub available: u64,
}

impl Space {
    pub fn used(&self) -> u64 {
        self.capacity.saturating_sub(self.available)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_user_info() {
        let json = r#"{"res_code":0,"loginName":"alice@189.cn","capacity":2199023255552,"available":2198023255552,"maxFilesize":21474836480}"#;
        let space: Space = serde_json::from_str(json).expect("user info");
        assert_eq!(space.capacity, 2_199_023_255_552);
        assert_eq!(space.used(), 1_000_000_000);
    }

    #[test]
    fn test_used_never_underflows() {
        let space = Space {
            capacity: 10,
            available: 20,
        };
        assert_eq!(space.used(), 0);
    }
}
