//! Kubernetes destinations: grants become RBAC bindings, credential requests
//! become service-account tokens.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::authentication::v1::{TokenRequest, TokenRequestSpec};
use k8s_openapi::api::core::v1::{Namespace, ServiceAccount};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, RoleBinding, RoleRef, Subject as RbacSubject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::Client;
use service_core::api::{AccessClient, CreateDestinationRequest, DestinationConnection, DestinationKind, Grant, User, CONNECT_PRIVILEGE};
use service_core::subject::Subject;
use sha2::{Digest, Sha256};
use tokio::sync::OnceCell;
use tracing::{debug, info, instrument, warn};

use crate::certs::{pem_certificates, CertCache};
use crate::config::{ConnectorConfig, KubernetesConfig};
use crate::error::ConnectorError;
use crate::sync::{CredentialIssuer, DestinationSource, GrantReconciler};

pub const MANAGED_BY_LABEL: &str = "app.infrahq.com/managed-by";
pub const MANAGED_BY_VALUE: &str = "connector";
const FIELD_MANAGER: &str = "infra-connector";
const RBAC_API_GROUP: &str = "rbac.authorization.k8s.io";

/// Label selectors for the cluster roles offered as grant privileges.
const ROLE_SELECTORS: [&str; 2] = [
    "kubernetes.io/bootstrapping=rbac-defaults",
    "app.infrahq.com/include-role=true",
];

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClusterRoleNamespace {
    pub cluster_role: String,
    pub namespace: String,
}

pub type ClusterRoleSubjects = BTreeMap<String, Vec<RbacSubject>>;
pub type RoleBindingSubjects = BTreeMap<ClusterRoleNamespace, Vec<RbacSubject>>;

/// Everything the connector needs from the cluster.
#[async_trait]
pub trait KubernetesClient: Send + Sync {
    /// Stable identifier of the cluster.
    async fn cluster_id(&self) -> Result<String, ConnectorError>;

    async fn namespaces(&self) -> Result<Vec<String>, ConnectorError>;

    async fn cluster_roles(&self) -> Result<Vec<String>, ConnectorError>;

    /// Make the managed cluster role bindings exactly `subjects`.
    async fn update_cluster_role_bindings(&self, subjects: &ClusterRoleSubjects) -> Result<(), ConnectorError>;

    /// Make the managed role bindings exactly `subjects`.
    async fn update_role_bindings(&self, subjects: &RoleBindingSubjects) -> Result<(), ConnectorError>;

    /// Mint a token for the user's service account, creating the account
    /// when needed.
    async fn create_service_account_token(&self, user_name: &str) -> Result<(String, DateTime<Utc>), ConnectorError>;
}

/// Service account minted tokens authenticate as: `infra-` and the user name
/// folded into a DNS subdomain.
pub fn service_account_name(user_name: &str) -> String {
    let folded: String = user_name
        .to_lowercase()
        .chars()
        .map(|c| match c {
            'a'..='z' | '0'..='9' | '.' | '-' => c,
            _ => '-',
        })
        .collect();
    let mut name = format!("infra-{}", folded.trim_matches(|c| c == '-' || c == '.'));
    name.truncate(253);
    name.trim_end_matches(|c| c == '-' || c == '.').to_string()
}

fn push_unique(subjects: &mut Vec<RbacSubject>, subject: &RbacSubject) {
    if !subjects.contains(subject) {
        subjects.push(subject.clone());
    }
}

fn managed_meta(name: &str, namespace: Option<&str>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: namespace.map(str::to_string),
        labels: Some(BTreeMap::from([(MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string())])),
        ..ObjectMeta::default()
    }
}

fn binding_name(cluster_role: &str) -> String {
    format!("infra:{}", cluster_role)
}

fn cluster_role_ref(cluster_role: &str) -> RoleRef {
    RoleRef {
        api_group: RBAC_API_GROUP.to_string(),
        kind: "ClusterRole".to_string(),
        name: cluster_role.to_string(),
    }
}

#[derive(Debug, Default, PartialEq)]
pub struct Bindings {
    pub cluster: ClusterRoleSubjects,
    pub namespaced: RoleBindingSubjects,
}

/// Translate grants into bindings. Resources are `<destination>` for a
/// cluster-wide binding or `<destination>.<namespace>` for one namespace.
/// Grants whose subject has no entry in `subjects` are left out.
pub fn role_bindings(grants: &[Grant], subjects: &HashMap<Subject, Vec<RbacSubject>>) -> Bindings {
    let mut bindings = Bindings::default();

    for grant in grants {
        if grant.privilege == CONNECT_PRIVILEGE {
            continue;
        }
        let Some(resolved) = subjects.get(&grant.subject) else {
            continue;
        };

        let parts: Vec<&str> = grant.resource.split('.').collect();
        match parts.as_slice() {
            [_] => {
                let entry = bindings.cluster.entry(grant.privilege.clone()).or_default();
                resolved.iter().for_each(|s| push_unique(entry, s));
            }
            [_, namespace] => {
                let key = ClusterRoleNamespace {
                    cluster_role: grant.privilege.clone(),
                    namespace: namespace.to_string(),
                };
                let entry = bindings.namespaced.entry(key).or_default();
                resolved.iter().for_each(|s| push_unique(entry, s));
            }
            _ => warn!(resource = %grant.resource, "Invalid grant resource"),
        }
    }

    bindings
}

pub struct KubeClient {
    client: Client,
    namespace: String,
    credential_ttl_seconds: i64,
}

impl KubeClient {
    pub async fn new(config: &KubernetesConfig) -> Result<Self, ConnectorError> {
        let client = match &config.api_url {
            Some(url) => {
                let uri: http::Uri = url
                    .parse()
                    .map_err(|e| ConnectorError::Config(format!("KUBERNETES_API_URL: {}", e)))?;
                let ca = tokio::fs::read_to_string(&config.ca_path).await?;

                let mut kube_config = kube::Config::new(uri);
                kube_config.root_cert = Some(pem_certificates(&ca)?);
                kube_config.auth_info.token_file = Some(config.token_path.display().to_string());
                Client::try_from(kube_config)?
            }
            None => Client::try_default().await?,
        };
        debug!("Kubernetes client initialized");

        Ok(Self {
            client,
            namespace: config.namespace.clone(),
            credential_ttl_seconds: config.credential_ttl.as_secs() as i64,
        })
    }

    fn managed() -> ListParams {
        ListParams::default().labels(&format!("{}={}", MANAGED_BY_LABEL, MANAGED_BY_VALUE))
    }

    async fn ensure_service_account(&self, name: &str) -> Result<(), ConnectorError> {
        let accounts: Api<ServiceAccount> = Api::namespaced(self.client.clone(), &self.namespace);
        let account = ServiceAccount {
            metadata: managed_meta(name, Some(&self.namespace)),
            ..ServiceAccount::default()
        };
        match accounts.create(&PostParams::default(), &account).await {
            Ok(_) => {
                info!(service_account = %name, namespace = %self.namespace, "Created service account");
                Ok(())
            }
            Err(kube::Error::Api(err)) if err.code == 409 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl KubernetesClient for KubeClient {
    async fn cluster_id(&self) -> Result<String, ConnectorError> {
        let namespaces: Api<Namespace> = Api::all(self.client.clone());
        let system = namespaces.get("kube-system").await?;
        let uid = system
            .metadata
            .uid
            .ok_or_else(|| ConnectorError::Internal("kube-system namespace has no uid".to_string()))?;
        Ok(hex::encode(Sha256::digest(uid.as_bytes())))
    }

    async fn namespaces(&self) -> Result<Vec<String>, ConnectorError> {
        let namespaces: Api<Namespace> = Api::all(self.client.clone());
        let list = namespaces.list(&ListParams::default()).await?;
        let mut names: Vec<String> = list.items.into_iter().filter_map(|ns| ns.metadata.name).collect();
        names.sort();
        Ok(names)
    }

    async fn cluster_roles(&self) -> Result<Vec<String>, ConnectorError> {
        let roles: Api<ClusterRole> = Api::all(self.client.clone());
        let mut names = BTreeSet::new();
        for selector in ROLE_SELECTORS {
            let list = roles.list(&ListParams::default().labels(selector)).await?;
            names.extend(
                list.items
                    .into_iter()
                    .filter_map(|role| role.metadata.name)
                    .filter(|name| !name.starts_with("system:")),
            );
        }
        Ok(names.into_iter().collect())
    }

    #[instrument(skip_all, fields(bindings = subjects.len()))]
    async fn update_cluster_role_bindings(&self, subjects: &ClusterRoleSubjects) -> Result<(), ConnectorError> {
        let api: Api<ClusterRoleBinding> = Api::all(self.client.clone());
        let params = PatchParams::apply(FIELD_MANAGER).force();
        let mut errors = Vec::new();
        let mut desired = BTreeSet::new();

        for (role, role_subjects) in subjects {
            let name = binding_name(role);
            let binding = ClusterRoleBinding {
                metadata: managed_meta(&name, None),
                role_ref: cluster_role_ref(role),
                subjects: Some(role_subjects.clone()),
            };
            match api.patch(&name, &params, &Patch::Apply(&binding)).await {
                Ok(_) => debug!(binding = %name, "Applied cluster role binding"),
                Err(e) => errors.push(format!("apply cluster role binding {}: {}", name, e)),
            }
            desired.insert(name);
        }

        for existing in api.list(&Self::managed()).await?.items {
            let Some(name) = existing.metadata.name else { continue };
            if desired.contains(&name) {
                continue;
            }
            match api.delete(&name, &DeleteParams::default()).await {
                Ok(_) => info!(binding = %name, "Deleted cluster role binding"),
                Err(kube::Error::Api(err)) if err.code == 404 => {}
                Err(e) => errors.push(format!("delete cluster role binding {}: {}", name, e)),
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConnectorError::Reconcile(errors))
        }
    }

    #[instrument(skip_all, fields(bindings = subjects.len()))]
    async fn update_role_bindings(&self, subjects: &RoleBindingSubjects) -> Result<(), ConnectorError> {
        let params = PatchParams::apply(FIELD_MANAGER).force();
        let mut errors = Vec::new();
        let mut desired = BTreeSet::new();

        for (crn, role_subjects) in subjects {
            let name = binding_name(&crn.cluster_role);
            let api: Api<RoleBinding> = Api::namespaced(self.client.clone(), &crn.namespace);
            let binding = RoleBinding {
                metadata: managed_meta(&name, Some(&crn.namespace)),
                role_ref: cluster_role_ref(&crn.cluster_role),
                subjects: Some(role_subjects.clone()),
            };
            match api.patch(&name, &params, &Patch::Apply(&binding)).await {
                Ok(_) => debug!(binding = %name, namespace = %crn.namespace, "Applied role binding"),
                Err(e) => errors.push(format!("apply role binding {}/{}: {}", crn.namespace, name, e)),
            }
            desired.insert((crn.namespace.clone(), name));
        }

        let all: Api<RoleBinding> = Api::all(self.client.clone());
        for existing in all.list(&Self::managed()).await?.items {
            let (Some(namespace), Some(name)) = (existing.metadata.namespace, existing.metadata.name) else {
                continue;
            };
            if desired.contains(&(namespace.clone(), name.clone())) {
                continue;
            }
            let api: Api<RoleBinding> = Api::namespaced(self.client.clone(), &namespace);
            match api.delete(&name, &DeleteParams::default()).await {
                Ok(_) => info!(binding = %name, namespace = %namespace, "Deleted role binding"),
                Err(kube::Error::Api(err)) if err.code == 404 => {}
                Err(e) => errors.push(format!("delete role binding {}/{}: {}", namespace, name, e)),
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConnectorError::Reconcile(errors))
        }
    }

    #[instrument(skip(self))]
    async fn create_service_account_token(&self, user_name: &str) -> Result<(String, DateTime<Utc>), ConnectorError> {
        let name = service_account_name(user_name);
        self.ensure_service_account(&name).await?;

        let request = TokenRequest {
            metadata: ObjectMeta::default(),
            spec: TokenRequestSpec {
                expiration_seconds: Some(self.credential_ttl_seconds),
                ..TokenRequestSpec::default()
            },
            status: None,
        };
        let accounts: Api<ServiceAccount> = Api::namespaced(self.client.clone(), &self.namespace);
        let response: TokenRequest = accounts
            .create_subresource("token", &name, &PostParams::default(), serde_json::to_vec(&request)?)
            .await?;

        let status = response
            .status
            .ok_or_else(|| ConnectorError::Internal(format!("token request for {} returned no status", name)))?;
        Ok((status.token, status.expiration_timestamp.0))
    }
}

/// A Kubernetes destination.
pub struct KubernetesConnector {
    kube: Arc<dyn KubernetesClient>,
    certs: Arc<CertCache>,
    name: String,
    version: String,
    endpoint_addr: String,
    namespace: String,
    cluster_id: OnceCell<String>,
}

impl KubernetesConnector {
    pub fn new(config: &ConnectorConfig, kube: Arc<dyn KubernetesClient>, certs: Arc<CertCache>) -> Self {
        Self {
            kube,
            certs,
            name: config.name.clone(),
            version: config.service_version.clone(),
            endpoint_addr: config.endpoint_addr.clone(),
            namespace: config.kubernetes.namespace.clone(),
            cluster_id: OnceCell::new(),
        }
    }

    /// The RBAC subjects a grant subject stands for. `None` when the identity
    /// is gone from the server.
    async fn resolve(&self, api: &AccessClient, subject: Subject) -> Result<Option<Vec<RbacSubject>>, ConnectorError> {
        let rbac = |kind: &str, name: String, namespace: Option<String>| RbacSubject {
            api_group: (kind != "ServiceAccount").then(|| RBAC_API_GROUP.to_string()),
            kind: kind.to_string(),
            name,
            namespace,
        };

        match subject {
            Subject::Group(id) => match api.get_group(id).await {
                Ok(group) => Ok(Some(vec![rbac("Group", group.name, None)])),
                Err(e) if e.is_not_found() => Ok(None),
                Err(e) => Err(e.into()),
            },
            Subject::User(id) => match api.get_user(id).await {
                Ok(user) => Ok(Some(vec![
                    rbac("ServiceAccount", service_account_name(&user.name), Some(self.namespace.clone())),
                    rbac("User", user.name, None),
                ])),
                Err(e) if e.is_not_found() => Ok(None),
                Err(e) => Err(e.into()),
            },
            Subject::Machine(id) => match api.get_user(id).await {
                Ok(machine) => Ok(Some(vec![rbac("User", machine.name, None)])),
                Err(e) if e.is_not_found() => Ok(None),
                Err(e) => Err(e.into()),
            },
        }
    }
}

#[async_trait]
impl GrantReconciler for KubernetesConnector {
    #[instrument(skip_all, fields(grants = grants.len()))]
    async fn reconcile(&self, api: &AccessClient, grants: &[Grant]) -> Result<(), ConnectorError> {
        let mut subjects = HashMap::new();
        for grant in grants.iter().filter(|g| g.privilege != CONNECT_PRIVILEGE) {
            if subjects.contains_key(&grant.subject) {
                continue;
            }
            match self.resolve(api, grant.subject).await? {
                Some(resolved) => {
                    subjects.insert(grant.subject, resolved);
                }
                None => debug!(subject = %grant.subject, "Grant subject no longer exists"),
            }
        }

        let mut bindings = role_bindings(grants, &subjects);

        let roles: BTreeSet<String> = self.kube.cluster_roles().await?.into_iter().collect();
        let namespaces: BTreeSet<String> = self.kube.namespaces().await?.into_iter().collect();
        bindings.cluster.retain(|role, _| {
            let known = roles.contains(role);
            if !known {
                warn!(role = %role, "Skipping grant for unknown cluster role");
            }
            known
        });
        bindings.namespaced.retain(|crn, _| {
            if !roles.contains(&crn.cluster_role) {
                warn!(role = %crn.cluster_role, "Skipping grant for unknown cluster role");
                return false;
            }
            if !namespaces.contains(&crn.namespace) {
                warn!(namespace = %crn.namespace, "Skipping grant for missing namespace");
                return false;
            }
            true
        });

        let mut errors = Vec::new();
        if let Err(e) = self.kube.update_cluster_role_bindings(&bindings.cluster).await {
            errors.push(format!("update cluster role bindings: {}", e));
        }
        if let Err(e) = self.kube.update_role_bindings(&bindings.namespaced).await {
            errors.push(format!("update role bindings: {}", e));
        }
        if !errors.is_empty() {
            return Err(ConnectorError::Reconcile(errors));
        }

        info!(
            cluster_bindings = bindings.cluster.len(),
            role_bindings = bindings.namespaced.len(),
            "Reconciled grants"
        );
        Ok(())
    }
}

#[async_trait]
impl DestinationSource for KubernetesConnector {
    async fn describe(&self) -> Result<CreateDestinationRequest, ConnectorError> {
        let unique_id = self
            .cluster_id
            .get_or_try_init(|| self.kube.cluster_id())
            .await?
            .clone();

        let host = match self.endpoint_addr.rsplit_once(':') {
            Some((host, _port)) => host.trim_start_matches('[').trim_end_matches(']'),
            None => self.endpoint_addr.as_str(),
        };
        self.certs.add_host(host)?;

        Ok(CreateDestinationRequest {
            unique_id,
            name: self.name.clone(),
            kind: DestinationKind::Kubernetes,
            version: self.version.clone(),
            connection: DestinationConnection {
                url: self.endpoint_addr.clone(),
                ca: self.certs.ca_pem().to_string(),
            },
            resources: self.kube.namespaces().await?,
            roles: self.kube.cluster_roles().await?,
        })
    }
}

#[async_trait]
impl CredentialIssuer for KubernetesConnector {
    async fn issue(&self, user: &User) -> Result<(String, DateTime<Utc>), ConnectorError> {
        self.kube.create_service_account_token(&user.name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use service_core::uid::Id;
    use std::sync::Mutex;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[derive(Default)]
    struct FakeCluster {
        cluster: Mutex<Vec<ClusterRoleSubjects>>,
        namespaced: Mutex<Vec<RoleBindingSubjects>>,
        tokens: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl KubernetesClient for FakeCluster {
        async fn cluster_id(&self) -> Result<String, ConnectorError> {
            Ok(hex::encode(Sha256::digest(b"kube-system-uid")))
        }

        async fn namespaces(&self) -> Result<Vec<String>, ConnectorError> {
            Ok(vec!["default".into(), "kube-system".into()])
        }

        async fn cluster_roles(&self) -> Result<Vec<String>, ConnectorError> {
            Ok(vec!["admin".into(), "edit".into(), "view".into()])
        }

        async fn update_cluster_role_bindings(&self, subjects: &ClusterRoleSubjects) -> Result<(), ConnectorError> {
            self.cluster.lock().unwrap().push(subjects.clone());
            Ok(())
        }

        async fn update_role_bindings(&self, subjects: &RoleBindingSubjects) -> Result<(), ConnectorError> {
            self.namespaced.lock().unwrap().push(subjects.clone());
            Ok(())
        }

        async fn create_service_account_token(&self, user_name: &str) -> Result<(String, DateTime<Utc>), ConnectorError> {
            self.tokens.lock().unwrap().push(user_name.to_string());
            Ok((format!("token-for-{}", service_account_name(user_name)), Utc::now()))
        }
    }

    fn grant(subject: Subject, privilege: &str, resource: &str) -> Grant {
        Grant {
            id: Id::from_i64(1),
            created: Utc::now(),
            created_by: Id::from_i64(2),
            updated: Utc::now(),
            subject,
            privilege: privilege.to_string(),
            resource: resource.to_string(),
        }
    }

    fn group_subject(name: &str) -> RbacSubject {
        RbacSubject {
            api_group: Some(RBAC_API_GROUP.to_string()),
            kind: "Group".to_string(),
            name: name.to_string(),
            namespace: None,
        }
    }

    #[test]
    fn service_account_names_are_dns_safe() {
        assert_eq!(service_account_name("alice@example.com"), "infra-alice-example.com");
        assert_eq!(service_account_name("Bob Smith"), "infra-bob-smith");
        assert!(service_account_name(&"x".repeat(400)).len() <= 253);
    }

    #[test]
    fn resources_map_to_cluster_and_namespace_bindings() {
        let devs = Subject::Group(Id::from_i64(10));
        let ops = Subject::Group(Id::from_i64(11));
        let unknown = Subject::Group(Id::from_i64(12));
        let subjects = HashMap::from([(devs, vec![group_subject("devs")]), (ops, vec![group_subject("ops")])]);

        let grants = vec![
            grant(devs, "view", "prod"),
            grant(ops, "view", "prod"),
            grant(devs, "view", "prod"),
            grant(devs, "edit", "prod.default"),
            grant(devs, "connect", "prod"),
            grant(ops, "admin", "prod.a.b"),
            grant(unknown, "admin", "prod"),
        ];
        let bindings = role_bindings(&grants, &subjects);

        assert_eq!(bindings.cluster.len(), 1);
        assert_eq!(bindings.cluster["view"], vec![group_subject("devs"), group_subject("ops")]);
        let key = ClusterRoleNamespace {
            cluster_role: "edit".into(),
            namespace: "default".into(),
        };
        assert_eq!(bindings.namespaced[&key], vec![group_subject("devs")]);
        assert_eq!(bindings.namespaced.len(), 1);
    }

    #[tokio::test]
    async fn reconcile_resolves_names_and_drops_unknown_targets() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/users/4"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "4", "name": "alice@example.com",
                "created": "2024-01-01T00:00:00Z", "updated": "2024-01-01T00:00:00Z",
                "lastSeenAt": null, "verified": true, "providerNames": [],
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/groups/5"))
            .respond_with(ResponseTemplate::new(404).set_body_json(serde_json::json!({"error": "not found"})))
            .mount(&server)
            .await;

        let cluster = Arc::new(FakeCluster::default());
        let config = ConnectorConfig::for_tests(&server.uri(), DestinationKind::Kubernetes);
        let connector = KubernetesConnector::new(&config, cluster.clone(), Arc::new(CertCache::generate().unwrap()));
        let api = AccessClient::new(&server.uri(), "key").unwrap();

        let alice = Subject::User("4".parse().unwrap());
        let gone = Subject::Group("5".parse().unwrap());
        let grants = vec![
            grant(alice, "view", "prod"),
            grant(alice, "edit", "prod.default"),
            grant(alice, "edit", "prod.missing"),
            grant(alice, "cluster-admin-ish", "prod"),
            grant(gone, "admin", "prod"),
        ];
        connector.reconcile(&api, &grants).await.unwrap();

        let cluster_bindings = cluster.cluster.lock().unwrap();
        let view = &cluster_bindings[0]["view"];
        assert_eq!(view.len(), 2);
        assert_eq!(view[0].kind, "ServiceAccount");
        assert_eq!(view[0].name, "infra-alice-example.com");
        assert_eq!(view[0].namespace.as_deref(), Some("infra"));
        assert_eq!(view[1].kind, "User");
        assert_eq!(view[1].name, "alice@example.com");
        assert!(!cluster_bindings[0].contains_key("cluster-admin-ish"));
        assert!(!cluster_bindings[0].contains_key("admin"));

        let namespaced = cluster.namespaced.lock().unwrap();
        assert_eq!(namespaced[0].len(), 1);
        assert!(namespaced[0].keys().all(|k| k.namespace == "default"));
    }

    #[tokio::test]
    async fn describe_publishes_namespaces_roles_and_ca() {
        let cluster = Arc::new(FakeCluster::default());
        let certs = Arc::new(CertCache::generate().unwrap());
        let mut config = ConnectorConfig::for_tests("http://localhost:8080", DestinationKind::Kubernetes);
        config.endpoint_addr = "connector.example.com:443".into();
        let connector = KubernetesConnector::new(&config, cluster, certs.clone());

        let described = connector.describe().await.unwrap();
        assert_eq!(described.kind, DestinationKind::Kubernetes);
        assert_eq!(described.unique_id.len(), 64);
        assert_eq!(described.connection.url, "connector.example.com:443");
        assert_eq!(described.connection.ca, certs.ca_pem());
        assert_eq!(described.resources, vec!["default", "kube-system"]);
        assert_eq!(described.roles, vec!["admin", "edit", "view"]);
        assert_eq!(certs.hosts(), vec!["connector.example.com"]);
    }

    #[tokio::test]
    async fn issuing_mints_a_service_account_token() {
        let cluster = Arc::new(FakeCluster::default());
        let config = ConnectorConfig::for_tests("http://localhost:8080", DestinationKind::Kubernetes);
        let connector = KubernetesConnector::new(&config, cluster.clone(), Arc::new(CertCache::generate().unwrap()));
        let user = User {
            id: Id::from_i64(4),
            name: "alice@example.com".into(),
            created: Utc::now(),
            updated: Utc::now(),
            last_seen_at: None,
            verified: true,
            provider_names: vec![],
        };

        let (token, _) = connector.issue(&user).await.unwrap();
        assert_eq!(token, "token-for-infra-alice-example.com");
        assert_eq!(cluster.tokens.lock().unwrap().as_slice(), &["alice@example.com".to_string()]);
    }
}
