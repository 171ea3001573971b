//! Keystore for identity persistence
//!
//! Handles loading and saving the node's signing key and machine id to
//! disk, ensuring identity persists across restarts.

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{CoreError, CoreResult};
use crate::identity::{Identity, MachineId};

/// Filename for the Ed25519 secret key
const IDENTITY_KEY_FILENAME: &str = "identity.key";

/// Filename for the machine id
const MACHINE_ID_FILENAME: &str = "machine.id";

/// Keystore for managing identity persistence
///
/// The keystore saves and loads the node's secret key and machine id from
/// a data directory, allowing the node to keep the same identity across
/// restarts.
pub struct Keystore {
    path: PathBuf,
}

impl Keystore {
    /// Create a new keystore rooted at the given data directory
    pub fn new(data_dir: &Path) -> Self {
        Self {
            path: data_dir.to_path_buf(),
        }
    }

    fn identity_path(&self) -> PathBuf {
        self.path.join(IDENTITY_KEY_FILENAME)
    }

    fn machine_id_path(&self) -> PathBuf {
        self.path.join(MACHINE_ID_FILENAME)
    }

    /// Load the existing identity or generate and persist a new one
    pub fn load_or_generate_identity(&self) -> CoreResult<Identity> {
        let key_path = self.identity_path();

        if key_path.exists() {
            self.load_identity()
        } else {
            info!("No existing identity found, generating new key");
            let identity = Identity::generate();
            self.save_identity(&identity)?;
            Ok(identity)
        }
    }

    /// Load the identity from disk
    pub fn load_identity(&self) -> CoreResult<Identity> {
        let key_path = self.identity_path();

        let bytes = std::fs::read(&key_path)
            .map_err(|e| CoreError::Keystore(format!("Failed to read identity file: {}", e)))?;

        if bytes.len() != 32 {
            return Err(CoreError::Keystore(format!(
                "Invalid identity file: expected 32 bytes, got {}",
                bytes.len()
            )));
        }

        let mut key_bytes = [0u8; 32];
        key_bytes.copy_from_slice(&bytes);

        let identity = Identity::from_bytes(&key_bytes);
        debug!(peer = %identity.peer_id().short_id(), "Loaded identity from keystore");

        Ok(identity)
    }

    /// Save the identity to disk
    pub fn save_identity(&self, identity: &Identity) -> CoreResult<()> {
        std::fs::create_dir_all(&self.path)
            .map_err(|e| CoreError::Keystore(format!("Failed to create keystore dir: {}", e)))?;

        let key_path = self.identity_path();
        std::fs::write(&key_path, identity.to_bytes())
            .map_err(|e| CoreError::Keystore(format!("Failed to write identity file: {}", e)))?;

        Self::set_restrictive_permissions(&key_path)?;

        info!(
            peer = %identity.peer_id().short_id(),
            path = %key_path.display(),
            "Saved identity to keystore"
        );

        Ok(())
    }

    /// Load the machine id or generate and persist a new one
    pub fn load_or_generate_machine_id(&self) -> CoreResult<MachineId> {
        let path = self.machine_id_path();

        if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| CoreError::Keystore(format!("Failed to read machine id: {}", e)))?;
            MachineId::parse(text.trim())
        } else {
            let machine_id = MachineId::generate();
            std::fs::create_dir_all(&self.path)
                .map_err(|e| CoreError::Keystore(format!("Failed to create keystore dir: {}", e)))?;
            std::fs::write(&path, machine_id.as_string())
                .map_err(|e| CoreError::Keystore(format!("Failed to write machine id: {}", e)))?;
            info!(machine = %machine_id, "Generated new machine id");
            Ok(machine_id)
        }
    }

    #[cfg(unix)]
    fn set_restrictive_permissions(path: &Path) -> CoreResult<()> {
        use std::os::unix::fs::PermissionsExt;

        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(path, perms)
            .map_err(|e| CoreError::Keystore(format!("Failed to set permissions: {}", e)))
    }

    #[cfg(not(unix))]
    fn set_restrictive_permissions(_path: &Path) -> CoreResult<()> {
        Ok(())
    }
}
