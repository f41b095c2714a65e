use rand::RngCore;
use sha2::{Digest, Sha512};

/// Paramètres du document cloud-init généré à l'installation
#[derive(Debug, Clone)]
pub struct CloudInitOpts {
    pub hostname: String,
    pub username: String,
    /// Hash de mot de passe au format shadow, jamais le clair
    pub password_hash: String,
    pub ssh_keys: Vec<String>,
    pub passwordless_sudo: bool,
    pub password_authentication: bool,
    pub lock_password: bool,
    pub update_packages: bool,
}

/// Hash style shadow (`$6$<sel>$<empreinte>`) : SHA-512 du mot de passe
/// salé, sel aléatoire de 16 octets
pub fn shadow_hash(password: &str) -> String {
    let mut salt_bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut salt_bytes);
    let salt = hex::encode(salt_bytes);

    let mut hasher = Sha512::new();
    hasher.update(password.as_bytes());
    hasher.update(salt.as_bytes());
    let digest = hex::encode(hasher.finalize());

    format!("$6${salt}${digest}")
}

/// Rend le document user-data consommé au premier boot
pub fn render_user_data(opts: &CloudInitOpts) -> String {
    let mut doc = String::from("#cloud-config\n");
    doc.push_str(&format!("package_update: {}\n", opts.update_packages));
    doc.push_str(&format!("hostname: {}\n", opts.hostname));
    doc.push_str("resize_rootfs: true\n");
    doc.push_str("package_upgrade: true\n");
    doc.push_str(&format!("ssh_pwauth: {}\n", opts.password_authentication));
    doc.push_str("users:\n");
    doc.push_str(&format!("  - name: {}\n", opts.username));
    doc.push_str(&format!("    lock_passwd: {}\n", opts.lock_password));
    doc.push_str(&format!("    passwd: {}\n", opts.password_hash));
    doc.push_str(&format!(
        "    sudo: ALL=(ALL) {}\n",
        if opts.passwordless_sudo { "NOPASSWD:ALL" } else { "ALL" }
    ));
    doc.push_str("    chpasswd: { expire: False }\n");
    doc.push_str("    shell: /bin/bash\n");
    if !opts.ssh_keys.is_empty() {
        doc.push_str("    ssh_authorized_keys:\n");
        for key in &opts.ssh_keys {
            doc.push_str(&format!("      - {key}\n"));
        }
    }
    doc
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts() -> CloudInitOpts {
        CloudInitOpts {
            hostname: "vm1".into(),
            username: "admin".into(),
            password_hash: "$6$abcd$ef01".into(),
            ssh_keys: vec!["ssh-ed25519 AAAA test@host".into()],
            passwordless_sudo: true,
            password_authentication: true,
            lock_password: false,
            update_packages: true,
        }
    }

    #[test]
    fn test_shadow_hash_shape() {
        let hash = shadow_hash("hunter2");
        let parts: Vec<&str> = hash.split('$').collect();
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[1], "6");
        assert_eq!(parts[2].len(), 32);
        assert_eq!(parts[3].len(), 128);
        // le clair n'apparaît jamais
        assert!(!hash.contains("hunter2"));
        // sel aléatoire : deux hashes du même clair diffèrent
        assert_ne!(hash, shadow_hash("hunter2"));
    }

    #[test]
    fn test_render_with_ssh_keys() {
        let doc = render_user_data(&opts());
        assert!(doc.starts_with("#cloud-config\n"));
        assert!(doc.contains("hostname: vm1\n"));
        assert!(doc.contains("passwd: $6$abcd$ef01\n"));
        assert!(doc.contains("sudo: ALL=(ALL) NOPASSWD:ALL\n"));
        assert!(doc.contains("ssh_authorized_keys:\n"));
        assert!(doc.contains("- ssh-ed25519 AAAA test@host"));
    }

    #[test]
    fn test_render_without_ssh_keys() {
        let mut o = opts();
        o.ssh_keys.clear();
        o.passwordless_sudo = false;
        let doc = render_user_data(&o);
        assert!(!doc.contains("ssh_authorized_keys"));
        assert!(doc.contains("sudo: ALL=(ALL) ALL\n"));
    }
}
