mod common;

use common::{ldap_config, TestApp};
use identity_service::models::{
    AccessMode, ApplyRequest, Credentials, PrincipalType, ProviderConfig, ProviderKind,
};
use identity_service::services::{IdentityError, LoginRequest};
use secrecy::ExposeSecret;

async fn enable(app: &TestApp, config: ProviderConfig, username: &str, password: &str) {
    app.core
        .apply
        .test_and_apply(ApplyRequest::new(config, Credentials::password(username, password)))
        .await
        .expect("Failed to apply provider config");
}

fn password_login(kind: ProviderKind, username: &str, password: &str) -> LoginRequest {
    LoginRequest::new(kind, Credentials::password(username, password))
}

#[tokio::test]
async fn test_local_login_issues_usable_token() {
    let app = TestApp::spawn().await;
    let user = app.create_local_user("alice", "correct-horse").await;
    let admins = app.core.local.create_group("Admins").await.unwrap();
    app.core
        .local
        .add_member(&admins.id, &user.local_principal_id())
        .await
        .unwrap();

    let issued = app
        .core
        .auth
        .login(password_login(ProviderKind::Local, "alice", "correct-horse"))
        .await
        .expect("Login should succeed");

    assert_eq!(issued.token.auth_provider, "local");
    assert_eq!(issued.token.user_id, user.id);
    assert!(issued.secret.expose_secret().len() >= 32);

    let session = app.core.auth.session(&issued.bearer()).unwrap();
    assert_eq!(session.user_principal.id, user.local_principal_id());
    assert_eq!(session.group_principals.len(), 1);
    assert_eq!(session.group_principals[0].display_name, "Admins");

    let cached = app
        .core
        .groups
        .lookup(&user.id, ProviderKind::Local, false)
        .await
        .unwrap();
    assert_eq!(cached.len(), 1);
}

#[tokio::test]
async fn test_unknown_user_and_wrong_password_look_identical() {
    let app = TestApp::spawn().await;
    app.create_local_user("alice", "correct-horse").await;

    let wrong_password = app
        .core
        .auth
        .login(password_login(ProviderKind::Local, "alice", "battery-staple"))
        .await
        .unwrap_err();
    let unknown_user = app
        .core
        .auth
        .login(password_login(ProviderKind::Local, "mallory", "battery-staple"))
        .await
        .unwrap_err();

    assert!(matches!(wrong_password, IdentityError::Credential(_)));
    assert!(matches!(unknown_user, IdentityError::Credential(_)));
    assert_eq!(wrong_password.to_string(), unknown_user.to_string());
}

#[tokio::test]
async fn test_directory_login_creates_and_reuses_user() {
    let app = TestApp::spawn().await;
    let dn = app.directory.add_ldap_user("jdoe", "Jane Doe", "pw-jdoe");
    app.directory.add_ldap_group("devs", &[&dn]);
    enable(&app, ldap_config(), "jdoe", "pw-jdoe").await;

    let first = app
        .core
        .auth
        .login(password_login(ProviderKind::Ldap, "jdoe", "pw-jdoe"))
        .await
        .expect("First login should succeed");
    let second = app
        .core
        .auth
        .login(password_login(ProviderKind::Ldap, "jdoe", "pw-jdoe"))
        .await
        .expect("Second login should succeed");

    assert_eq!(first.token.user_id, second.token.user_id);
    assert_eq!(first.token.user_principal.id, format!("ldap_user://{}", dn));
    assert_eq!(first.token.user_principal.display_name, "Jane Doe");
    assert_eq!(first.token.group_principals.len(), 1);
    assert_eq!(first.token.group_principals[0].principal_type, PrincipalType::Group);

    let user = app.core.users.get(&first.token.user_id, None).await.unwrap();
    assert!(user.has_principal(&format!("ldap_user://{}", dn)));
    assert!(user.has_principal(&user.local_principal_id()));

    let groups = app
        .core
        .groups
        .lookup(&user.id, ProviderKind::Ldap, false)
        .await
        .unwrap();
    assert_eq!(groups[0].login_name, "devs");
}

#[tokio::test]
async fn test_directory_wrong_password_is_masked() {
    let app = TestApp::spawn().await;
    app.directory.add_ldap_user("jdoe", "Jane Doe", "pw-jdoe");
    enable(&app, ldap_config(), "jdoe", "pw-jdoe").await;

    let wrong = app
        .core
        .auth
        .login(password_login(ProviderKind::Ldap, "jdoe", "nope"))
        .await
        .unwrap_err();
    let missing = app
        .core
        .auth
        .login(password_login(ProviderKind::Ldap, "ghost", "nope"))
        .await
        .unwrap_err();
    assert_eq!(wrong.to_string(), missing.to_string());
    assert!(app.core.users.list(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_required_access_mode_checks_allow_list() {
    let app = TestApp::spawn().await;
    let jane = app.directory.add_ldap_user("jdoe", "Jane Doe", "pw-jdoe");
    app.directory.add_ldap_user("bob", "Bob", "pw-bob");
    let devs = app.directory.add_ldap_group("devs", &[&jane]);

    let mut config = ldap_config();
    config.auth.access_mode = AccessMode::Required;
    config.auth.allowed_principal_ids = vec![format!("ldap_group://{}", devs)];
    enable(&app, config, "jdoe", "pw-jdoe").await;

    app.core
        .auth
        .login(password_login(ProviderKind::Ldap, "jdoe", "pw-jdoe"))
        .await
        .expect("Group member should be admitted");

    let err = app
        .core
        .auth
        .login(password_login(ProviderKind::Ldap, "bob", "pw-bob"))
        .await
        .unwrap_err();
    assert!(matches!(err, IdentityError::Credential(_)));
    assert!(app
        .core
        .users
        .find_by_principal(&format!("ldap_user://uid=bob,{}", common::LDAP_PEOPLE))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_restricted_access_mode_admits_known_users() {
    let app = TestApp::spawn().await;
    let admin = app.create_local_user("admin", "admin-pw").await;
    let bob = app.directory.add_ldap_user("bob", "Bob", "pw-bob");
    app.directory.add_ldap_user("eve", "Eve", "pw-eve");

    let mut config = ldap_config();
    config.auth.access_mode = AccessMode::Restricted;
    app.core
        .apply
        .test_and_apply(
            ApplyRequest::new(config, Credentials::password("bob", "pw-bob")).invoked_by(&admin.id),
        )
        .await
        .unwrap();

    let issued = app
        .core
        .auth
        .login(password_login(ProviderKind::Ldap, "bob", "pw-bob"))
        .await
        .expect("Linked user should be admitted");
    assert_eq!(issued.token.user_id, admin.id);
    assert_eq!(issued.token.user_principal.id, format!("ldap_user://{}", bob));

    assert!(app
        .core
        .auth
        .login(password_login(ProviderKind::Ldap, "eve", "pw-eve"))
        .await
        .is_err());
}

#[tokio::test]
async fn test_local_login_follows_active_provider_access_mode() {
    let app = TestApp::spawn().await;
    let admin = app.create_local_user("admin", "admin-pw").await;
    app.create_local_user("guest", "guest-pw").await;
    app.directory.add_ldap_user("jdoe", "Jane Doe", "pw-jdoe");

    let mut config = ldap_config();
    config.auth.access_mode = AccessMode::Required;
    config.auth.allowed_principal_ids = vec![admin.local_principal_id()];
    enable(&app, config, "jdoe", "pw-jdoe").await;

    app.core
        .auth
        .login(password_login(ProviderKind::Local, "admin", "admin-pw"))
        .await
        .expect("Allow-listed local user should log in");
    assert!(app
        .core
        .auth
        .login(password_login(ProviderKind::Local, "guest", "guest-pw"))
        .await
        .is_err());
}

#[tokio::test]
async fn test_login_to_inactive_provider_is_rejected() {
    let app = TestApp::spawn().await;
    let err = app
        .core
        .auth
        .login(password_login(ProviderKind::Ldap, "jdoe", "pw-jdoe"))
        .await
        .unwrap_err();
    assert!(matches!(err, IdentityError::Validation(_)));
}

#[tokio::test]
async fn test_logout_revokes_token() {
    let app = TestApp::spawn().await;
    app.create_local_user("alice", "correct-horse").await;
    let issued = app
        .core
        .auth
        .login(password_login(ProviderKind::Local, "alice", "correct-horse"))
        .await
        .unwrap();

    app.core.auth.logout(&issued.token.id).await.unwrap();
    assert!(matches!(
        app.core.auth.session(&issued.bearer()),
        Err(IdentityError::Invalid)
    ));
    // Revocation is idempotent.
    app.core.auth.logout(&issued.token.id).await.unwrap();
}

#[tokio::test]
async fn test_saml_login_uses_assertion_groups() {
    let app = TestApp::spawn().await;
    app.core
        .apply
        .test_and_apply(ApplyRequest::new(common::saml_config(), Credentials::None))
        .await
        .unwrap();

    let mut attributes = std::collections::BTreeMap::new();
    attributes.insert("uid".to_string(), vec!["jdoe".to_string()]);
    attributes.insert("displayName".to_string(), vec!["Jane".to_string()]);
    attributes.insert(
        "groups".to_string(),
        vec!["ops".to_string(), "ops".to_string(), "dev".to_string()],
    );

    let issued = app
        .core
        .auth
        .login(LoginRequest::new(
            ProviderKind::Saml,
            Credentials::SamlAssertion(attributes),
        ))
        .await
        .unwrap();
    assert_eq!(issued.token.user_principal.id, "saml_user://jdoe");
    let ids: Vec<_> = issued.token.group_principals.iter().map(|g| g.id.as_str()).collect();
    assert_eq!(ids, vec!["saml_group://ops", "saml_group://dev"]);
}
