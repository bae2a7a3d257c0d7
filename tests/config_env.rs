mod util;

use msgstore_correlator::{ConfigError, CorrelatorConfig};
use util::EnvGuard;

// Environment is process-wide, so every case lives in one test.
#[test]
fn env_overrides_file_and_rejects_bad_values() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("wacorr.toml");
    std::fs::write(&path, "merge_backups = false\ndownload_pool_size = 4\n").unwrap();

    {
        let _merge = EnvGuard::set("WACORR_MERGE_BACKUPS", "yes");
        let _pool = EnvGuard::set("WACORR_DOWNLOAD_POOL_SIZE", "0");
        let _timeout = EnvGuard::set("WACORR_DOWNLOAD_READ_TIMEOUT_MS", " 2500 ");
        let cfg = CorrelatorConfig::load(&path).unwrap();
        assert!(cfg.merge_backups);
        assert_eq!(cfg.download_pool_size, 1);
        assert_eq!(cfg.read_timeout().as_millis(), 2500);
        assert_eq!(cfg.download_connection_timeout_ms, 500);
    }

    {
        let _bad = EnvGuard::set("WACORR_DOWNLOAD_ENABLED", "sometimes");
        let err = CorrelatorConfig::from_env().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "WACORR_DOWNLOAD_ENABLED",
                ..
            }
        ));
    }

    let cfg = CorrelatorConfig::load(&path).unwrap();
    assert!(!cfg.merge_backups);
    assert_eq!(cfg.download_pool_size, 4);
}
