//! Ban and address table persistence

mod common;

use bllvm_connman::network::address_db::AddressEntry;
use bllvm_connman::network::ban_list::{BanEntry, BanMap, BanReason, SubNet};
use bllvm_connman::network::handshake::HandshakeHandler;
use bllvm_connman::network::protocol::{BITCOIN_MAGIC_MAINNET, BITCOIN_MAGIC_REGTEST};
use bllvm_connman::network::ConnectionManager;
use bllvm_connman::storage::{FlatFile, PersistError};
use bllvm_connman::utils::current_timestamp;
use common::test_config;

fn sample_bans() -> BanMap {
    let mut bans = BanMap::new();
    bans.insert(
        SubNet::single("1.2.3.4".parse().unwrap()),
        BanEntry::new(100, 1000, BanReason::FloodingWallet),
    );
    bans.insert(
        "2001:db8::/48".parse().unwrap(),
        BanEntry::new(200, u64::MAX, BanReason::ManuallyAdded),
    );
    bans
}

#[test]
fn test_ban_table_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let file = FlatFile::new(dir.path().join("banlist.dat"), BITCOIN_MAGIC_REGTEST);
    file.write(&sample_bans()).unwrap();
    let back: BanMap = file.read().unwrap();
    assert_eq!(back, sample_bans());
}

#[test]
fn test_any_flipped_byte_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("banlist.dat");
    let file = FlatFile::new(&path, BITCOIN_MAGIC_REGTEST);
    file.write(&sample_bans()).unwrap();
    let original = std::fs::read(&path).unwrap();

    for index in 0..original.len() {
        let mut corrupt = original.clone();
        corrupt[index] ^= 0x01;
        std::fs::write(&path, &corrupt).unwrap();
        assert!(
            matches!(file.read::<BanMap>(), Err(PersistError::ChecksumMismatch(_))),
            "flip at byte {} was accepted",
            index
        );
    }
}

#[test]
fn test_other_network_file_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("peers.dat");
    let entries = vec![AddressEntry::new("8.8.8.8:8333".parse().unwrap(), 1, 10)];
    FlatFile::new(&path, BITCOIN_MAGIC_MAINNET).write(&entries).unwrap();

    let read = FlatFile::new(&path, BITCOIN_MAGIC_REGTEST).read::<Vec<AddressEntry>>();
    assert!(matches!(read, Err(PersistError::MagicMismatch { .. })));
}

#[test]
fn test_manager_starts_empty_on_corrupt_tables() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    std::fs::write(config.storage.ban_file(), b"not a ban table at all, just noise").unwrap();
    std::fs::write(config.storage.address_file(), [0u8; 8]).unwrap();

    let manager = ConnectionManager::new(config, Box::new(HandshakeHandler::default()));
    manager.start().unwrap();
    assert!(manager.list_banned().is_empty());
    assert!(manager.fresh_addresses(10).is_empty());
    manager.shutdown();
}

#[test]
fn test_manager_persists_bans_across_restart() {
    let dir = tempfile::tempdir().unwrap();
    let subnet: SubNet = "192.0.2.0/24".parse().unwrap();

    let manager = ConnectionManager::new(test_config(dir.path()), Box::new(HandshakeHandler::default()));
    manager.start().unwrap();
    manager.ban(subnet, BanReason::ManuallyAdded, 3600, false);
    manager.shutdown();

    let restarted = ConnectionManager::new(test_config(dir.path()), Box::new(HandshakeHandler::default()));
    restarted.start().unwrap();
    let bans = restarted.list_banned();
    let entry = bans.get(&subnet).unwrap();
    assert_eq!(entry.reason, BanReason::ManuallyAdded);
    assert!(entry.ban_until > current_timestamp());
    restarted.shutdown();
}

#[test]
fn test_expired_bans_dropped_on_load() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let mut bans = sample_bans();
    bans.insert(
        SubNet::single("5.5.5.5".parse().unwrap()),
        BanEntry::new(0, 1, BanReason::Unknown),
    );
    FlatFile::new(config.storage.ban_file(), config.network.network.magic())
        .write(&bans)
        .unwrap();

    let manager = ConnectionManager::new(config, Box::new(HandshakeHandler::default()));
    manager.start().unwrap();
    let loaded = manager.list_banned();
    assert!(!loaded.contains_key(&SubNet::single("5.5.5.5".parse().unwrap())));
    // 1.2.3.4 expired at 1000 as well
    assert!(!loaded.contains_key(&SubNet::single("1.2.3.4".parse().unwrap())));
    assert_eq!(loaded.len(), 1);
    manager.shutdown();
}
