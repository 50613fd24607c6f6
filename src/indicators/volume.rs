use serde::{Deserialize, Serialize};

use super::mean;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct VolumeProfile {
    pub average: f64,
    pub current: f64,
    pub ratio: f64,
}

pub fn volume_profile(volumes: &[f64]) -> VolumeProfile {
    let average = mean(volumes);
    let current = volumes.last().copied().unwrap_or(0.0);
    let ratio = if average > 0.0 { current / average } else { 1.0 };
    VolumeProfile {
        average,
        current,
        ratio,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_volume_profile_empty_is_neutral() {
        let v = volume_profile(&[]);
        assert_eq!(v.ratio, 1.0);
        assert_eq!(v.current, 0.0);
    }

    #[test]
    fn test_volume_ratio() {
        let v = volume_profile(&[100.0, 100.0, 100.0, 300.0]);
        assert_eq!(v.current, 300.0);
        assert_eq!(v.average, 150.0);
        assert_eq!(v.ratio, 2.0);
    }
}
