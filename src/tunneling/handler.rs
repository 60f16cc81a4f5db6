use russh::client::Handler;
use tracing::{info, warn};

use crate::storage::Storage;

use super::tunnel::TunnelError;

/// Host-key verification strategy applied when the bastion presents its key.
pub(super) enum HostKeyVerifier {
    /// accept whatever the server presents (`hostKeyChecking=off`)
    AcceptAll,
    /// trust-on-first-use: store the fingerprint on first contact, require an
    /// exact match afterwards
    Tofu(Box<dyn Storage>),
}

pub(super) struct ClientHandler {
    /// `host:port` of the bastion, the key into the fingerprint store
    bastion_address: String,
    verifier: HostKeyVerifier,
}

impl ClientHandler {
    pub fn new(bastion_host: &str, bastion_port: u16, verifier: HostKeyVerifier) -> Self {
        ClientHandler {
            bastion_address: format!("{bastion_host}:{bastion_port}"),
            verifier,
        }
    }
}

impl Handler for ClientHandler {
    type Error = TunnelError;

    async fn check_server_key(
        &mut self,
        server_public_key: &russh::keys::ssh_key::PublicKey,
    ) -> Result<bool, Self::Error> {
        let server_fingerprint = server_public_key
            .fingerprint(Default::default())
            .to_string();

        let storage = match &self.verifier {
            HostKeyVerifier::AcceptAll => {
                warn!(
                    "accepting unverified host key for {} ({server_fingerprint})",
                    self.bastion_address
                );
                return Ok(true);
            }
            HostKeyVerifier::Tofu(storage) => storage,
        };

        match storage.get_server_fingerprint(&self.bastion_address).await {
            Ok(Some(stored_fingerprint)) => {
                if !server_fingerprint.eq(&stored_fingerprint) {
                    tracing::error!("{:?} host key has changed!", self.bastion_address);
                    return Err(TunnelError::KeyMismatch(self.bastion_address.clone()));
                }
                info!(
                    "host key for {:?} matches the stored one",
                    self.bastion_address
                );
                Ok(true)
            }
            Ok(None) => {
                // tofu: store the key!
                storage
                    .store_server_fingerprint(&self.bastion_address, &server_fingerprint)
                    .await?;
                Ok(true)
            }
            Err(e) => {
                tracing::error!("{}", e.to_string());
                Err(TunnelError::StorageLayer(e.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MockStorage;
    use mockall::predicate::*;
    use russh::keys::PublicKey;

    fn create_public_key() -> PublicKey {
        PublicKey::from_openssh(
            "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAILM+rvN+ot98qgEN796jTiQfZfG1KaT0PtFDJ/XFSqti foo@bar.com",
        ).unwrap()
    }

    fn changed_public_key() -> PublicKey {
        PublicKey::from_openssh(
            "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIG9U2GJCV93/x/3BgfIsBGniZxit1ue9PrSU6cYmqcbo pangle@dongle.com",
        ).unwrap()
    }

    #[tokio::test]
    async fn first_contact_stores_fingerprint() {
        let public_key = create_public_key();
        let fingerprint = public_key.fingerprint(Default::default());
        let mut mock_storage = MockStorage::new();
        mock_storage
            .expect_get_server_fingerprint()
            .with(eq("bastion.example.com:22000"))
            .times(1)
            .returning(|_| Ok(None));
        mock_storage
            .expect_store_server_fingerprint()
            .with(eq("bastion.example.com:22000"), eq(fingerprint.to_string()))
            .times(1)
            .returning(|_, _| Ok(()));

        let mut handler = ClientHandler::new(
            "bastion.example.com",
            22000,
            HostKeyVerifier::Tofu(Box::new(mock_storage)),
        );

        let result = handler.check_server_key(&public_key).await;
        assert!(result.is_ok());
        assert!(result.unwrap());
    }

    #[tokio::test]
    async fn changed_key_is_rejected() {
        let mut mock_storage = MockStorage::new();
        mock_storage
            .expect_get_server_fingerprint()
            .with(eq("bastion.example.com:22000"))
            .times(1)
            .returning(|_| {
                let fingerprint = create_public_key().fingerprint(Default::default());
                Ok(Some(fingerprint.to_string()))
            });

        let mut handler = ClientHandler::new(
            "bastion.example.com",
            22000,
            HostKeyVerifier::Tofu(Box::new(mock_storage)),
        );

        let result = handler.check_server_key(&changed_public_key()).await;
        assert!(result.is_err());
        assert!(matches!(
            result.unwrap_err(),
            TunnelError::KeyMismatch(addr) if addr == "bastion.example.com:22000"
        ));
    }

    #[tokio::test]
    async fn matching_key_is_accepted() {
        let mut mock_storage = MockStorage::new();
        mock_storage
            .expect_get_server_fingerprint()
            .with(eq("bastion.example.com:22000"))
            .times(1)
            .returning(|_| {
                let fingerprint = create_public_key().fingerprint(Default::default());
                Ok(Some(fingerprint.to_string()))
            });

        let mut handler = ClientHandler::new(
            "bastion.example.com",
            22000,
            HostKeyVerifier::Tofu(Box::new(mock_storage)),
        );

        let result = handler.check_server_key(&create_public_key()).await;
        assert!(result.is_ok());
        assert!(result.unwrap());
    }

    #[tokio::test]
    async fn checking_off_accepts_any_key() {
        let mut handler =
            ClientHandler::new("bastion.example.com", 22000, HostKeyVerifier::AcceptAll);

        let result = handler.check_server_key(&changed_public_key()).await;
        assert!(result.is_ok());
        assert!(result.unwrap());
    }
}
