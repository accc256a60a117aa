//! Test PKI: a root, an intermediate and leaves signed by the intermediate

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    IsCa, Issuer, KeyPair, KeyUsagePurpose,
};
use rustls::RootCertStore;

use crate::serving::Clock;

pub(crate) struct TestPki {
    pub roots: Arc<RootCertStore>,
    pub root_pem: String,
    pub intermediate_pem: String,
    intermediate: Issuer<'static, KeyPair>,
}

pub(crate) struct TestLeaf {
    pub key_pem: String,
    pub cert_pem: String,
}

impl TestLeaf {
    /// Key, leaf and intermediate in stored-blob order
    pub fn blob(&self, pki: &TestPki) -> Vec<u8> {
        format!("{}{}{}", self.key_pem, self.cert_pem, pki.intermediate_pem).into_bytes()
    }
}

fn ca_params(common_name: &str) -> CertificateParams {
    let mut params = CertificateParams::default();
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
    ];
    let mut distinguished_name = DistinguishedName::new();
    distinguished_name.push(DnType::CommonName, common_name);
    params.distinguished_name = distinguished_name;
    params
}

impl TestPki {
    pub fn new() -> Self {
        let root_key = KeyPair::generate().unwrap();
        let root_params = ca_params("certcache test root");
        let root_cert = root_params.self_signed(&root_key).unwrap();
        let root = Issuer::new(root_params, root_key);

        let intermediate_key = KeyPair::generate().unwrap();
        let intermediate_params = ca_params("certcache test intermediate");
        let intermediate_cert = intermediate_params
            .signed_by(&intermediate_key, &root)
            .unwrap();

        let mut roots = RootCertStore::empty();
        roots.add(root_cert.der().clone()).unwrap();

        Self {
            roots: Arc::new(roots),
            root_pem: root_cert.pem(),
            intermediate_pem: intermediate_cert.pem(),
            intermediate: Issuer::new(intermediate_params, intermediate_key),
        }
    }

    /// Leaf valid from an hour ago until a day from now
    pub fn leaf(&self, names: &[&str]) -> TestLeaf {
        let now = SystemTime::now();
        self.leaf_valid(
            names,
            now - Duration::from_secs(3600),
            now + Duration::from_secs(86400),
        )
    }

    pub fn leaf_valid(&self, names: &[&str], not_before: SystemTime, not_after: SystemTime) -> TestLeaf {
        let key = KeyPair::generate().unwrap();
        TestLeaf {
            key_pem: key.serialize_pem(),
            cert_pem: self.sign_leaf(names, not_before, not_after, &key),
        }
    }

    /// Leaf certificate PEM for an existing key, valid like [`TestPki::leaf`]
    pub fn leaf_cert_for(&self, names: &[&str], key: &KeyPair) -> String {
        let now = SystemTime::now();
        self.sign_leaf(
            names,
            now - Duration::from_secs(3600),
            now + Duration::from_secs(86400),
            key,
        )
    }

    fn sign_leaf(
        &self,
        names: &[&str],
        not_before: SystemTime,
        not_after: SystemTime,
        key: &KeyPair,
    ) -> String {
        let names: Vec<String> = names.iter().map(|n| n.to_string()).collect();
        let mut params = CertificateParams::new(names.clone()).unwrap();
        params.is_ca = IsCa::NoCa;
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.not_before = not_before.into();
        params.not_after = not_after.into();
        let mut distinguished_name = DistinguishedName::new();
        distinguished_name.push(DnType::CommonName, names.first().cloned().unwrap_or_default());
        params.distinguished_name = distinguished_name;

        params.signed_by(key, &self.intermediate).unwrap().pem()
    }
}

// openssl-generated keys, each stored in its legacy encoding and as PKCS#8
pub(crate) const RSA_PKCS1_PEM: &str = include_str!("serving/testdata/rsa_pkcs1.pem");
pub(crate) const RSA_PKCS8_PEM: &str = include_str!("serving/testdata/rsa_pkcs8.pem");
pub(crate) const EC_SEC1_PEM: &str = include_str!("serving/testdata/ec_sec1.pem");
pub(crate) const EC_PKCS8_PEM: &str = include_str!("serving/testdata/ec_pkcs8.pem");

/// Manually advanced clock
#[derive(Clone)]
pub(crate) struct MockClock(Arc<Mutex<SystemTime>>);

impl MockClock {
    pub fn new(start: SystemTime) -> Self {
        Self(Arc::new(Mutex::new(start)))
    }

    pub fn advance(&self, by: Duration) {
        *self.0.lock() += by;
    }

    pub fn clock(&self) -> Clock {
        let inner = self.0.clone();
        Arc::new(move || *inner.lock())
    }
}
