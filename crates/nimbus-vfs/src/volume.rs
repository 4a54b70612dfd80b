//! Synthetic volume-info entry.
//!
//! Desktop environments read `.xdg-volume-info` at the mount root to
//! label the volume. The entry is generated from the account's
//! principal name, lives only in memory, and is never uploaded.

use nimbus_core::domain::errors::DomainError;
use nimbus_core::domain::ids::ItemId;
use nimbus_core::domain::item::Inode;

/// Name of the synthetic entry at the mount root.
pub const VOLUME_INFO_NAME: &str = ".xdg-volume-info";

/// Builds the virtual inode for the volume-info file.
pub fn volume_info_inode(root: ItemId, principal: &str) -> Result<Inode, DomainError> {
    let body = format!("[Volume Info]\nName={}\nIconName=nimbusfs\n", principal);
    Inode::new_virtual(root, VOLUME_INFO_NAME, body.into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_volume_info_shape() {
        let inode =
            volume_info_inode(ItemId::new("ROOT").unwrap(), "ada@example.com").unwrap();
        assert!(inode.is_virtual());
        assert_eq!(inode.name(), ".xdg-volume-info");
        let body = String::from_utf8(inode.virtual_body().unwrap().to_vec()).unwrap();
        assert!(body.starts_with("[Volume Info]\n"));
        assert!(body.contains("Name=ada@example.com"));
        assert_eq!(inode.size() as usize, body.len());
    }
}
