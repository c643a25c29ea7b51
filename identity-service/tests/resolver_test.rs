mod common;

use common::{ldap_config, TestApp, LDAP_PEOPLE, LDAP_SERVER};
use futures::StreamExt;
use identity_service::models::{
    ApplyRequest, CallerContext, Credentials, Principal, PrincipalType, ProviderKind,
    SearchPrincipalsInput,
};
use identity_service::services::{ErrorKind, IdentityResult, TokenPolicy};
use std::time::Duration;

async fn with_ldap(app: &TestApp) -> (String, String) {
    let jdoe = app.directory.add_ldap_user("jdoe", "Jane Doe", "pw-jdoe");
    app.directory.add_ldap_user("jsmith", "John Smith", "pw-jsmith");
    let ops = app.directory.add_ldap_group("ops", &[&jdoe]);
    app.core
        .apply
        .test_and_apply(ApplyRequest::new(ldap_config(), Credentials::password("jdoe", "pw-jdoe")))
        .await
        .unwrap();
    (jdoe, ops)
}

async fn collect(
    app: &TestApp,
    text: &str,
    principal_type: Option<PrincipalType>,
    caller: Option<CallerContext>,
) -> Vec<IdentityResult<Principal>> {
    app.core
        .resolver
        .search(text, principal_type, caller)
        .await
        .unwrap()
        .collect()
        .await
}

#[tokio::test]
async fn test_search_lists_active_provider_before_local() {
    let app = TestApp::spawn().await;
    with_ldap(&app).await;
    app.create_local_user("jlocal", "jlocal-pw").await;

    let input: SearchPrincipalsInput =
        serde_json::from_str(r#"{"name": "j", "principalType": "user"}"#).unwrap();
    let results: Vec<IdentityResult<Principal>> = app
        .core
        .resolver
        .search_principals(&input, None)
        .await
        .unwrap()
        .collect()
        .await;
    let ids: Vec<String> = results.into_iter().map(|r| r.unwrap().login_name).collect();

    assert_eq!(ids, vec!["jdoe", "jsmith", "jlocal"]);
}

#[tokio::test]
async fn test_search_marks_caller_and_groups() {
    let app = TestApp::spawn().await;
    let (jdoe, ops) = with_ldap(&app).await;
    app.directory.add_ldap_group("oncall", &[]);

    let me = app
        .core
        .resolver
        .get_principal(&format!("ldap_user://{}", jdoe), None)
        .await
        .unwrap();
    let group = app
        .core
        .resolver
        .get_principal(&format!("ldap_group://{}", ops), None)
        .await
        .unwrap();
    let caller = CallerContext::new(&me, &[group]);

    let users = collect(&app, "jd", Some(PrincipalType::User), Some(caller.clone())).await;
    let jdoe_hit = users
        .iter()
        .map(|r| r.as_ref().unwrap())
        .find(|p| p.login_name == "jdoe")
        .unwrap();
    assert!(jdoe_hit.me);

    let groups = collect(&app, "o", Some(PrincipalType::Group), Some(caller)).await;
    let flags: Vec<(String, bool)> = groups
        .into_iter()
        .map(|r| r.unwrap())
        .map(|g| (g.login_name, g.member_of))
        .collect();
    assert_eq!(
        flags,
        vec![("oncall".to_string(), false), ("ops".to_string(), true)]
    );
}

#[tokio::test]
async fn test_get_principal_round_trips_search_results() {
    let app = TestApp::spawn().await;
    let (jdoe, _) = with_ldap(&app).await;

    let found = collect(&app, "jdoe", Some(PrincipalType::User), None).await;
    let hit = found.into_iter().next().unwrap().unwrap();
    assert_eq!(hit.id, format!("ldap_user://{}", jdoe));
    assert_eq!(hit.display_name, "Jane Doe");
    assert_eq!(hit.provider, "ldap");

    let fetched = app.core.resolver.get_principal(&hit.id, None).await.unwrap();
    assert_eq!(fetched.id, hit.id);
    assert_eq!(fetched.login_name, "jdoe");
}

#[tokio::test]
async fn test_missing_and_unreachable_are_distinguished() {
    let app = TestApp::spawn().await;
    let (jdoe, _) = with_ldap(&app).await;

    let missing = app
        .core
        .resolver
        .get_principal(&format!("ldap_user://uid=ghost,{}", LDAP_PEOPLE), None)
        .await
        .unwrap_err();
    assert_eq!(missing.kind(), ErrorKind::NotFound);

    app.directory.set_unreachable(LDAP_SERVER, true);
    let down = app
        .core
        .resolver
        .get_principal(&format!("ldap_user://{}", jdoe), None)
        .await
        .unwrap_err();
    assert_eq!(down.kind(), ErrorKind::ConnectionError);
}

#[tokio::test]
async fn test_inactive_provider_is_unavailable_not_missing() {
    let app = TestApp::spawn().await;
    let (jdoe, _) = with_ldap(&app).await;
    app.core.apply.disable(ProviderKind::Ldap).await.unwrap();

    let err = app
        .core
        .resolver
        .get_principal(&format!("ldap_user://{}", jdoe), None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConnectionError);

    let malformed = app.core.resolver.get_principal("not-a-principal", None).await.unwrap_err();
    assert_eq!(malformed.kind(), ErrorKind::ValidationError);
}

#[tokio::test]
async fn test_local_principals_resolve_without_federation() {
    let app = TestApp::spawn().await;
    let user = app.create_local_user("alice", "correct-horse").await;

    let principal = app
        .core
        .resolver
        .get_principal(&user.local_principal_id(), None)
        .await
        .unwrap();
    assert_eq!(principal.login_name, "alice");
    assert_eq!(principal.provider, "local");
}

#[tokio::test]
async fn test_slow_provider_times_out() {
    let app = TestApp::spawn_with(TokenPolicy::default(), Duration::from_millis(200)).await;
    let (jdoe, _) = with_ldap(&app).await;
    app.directory.set_delay(Duration::from_millis(600));

    let err = app
        .core
        .resolver
        .get_principal(&format!("ldap_user://{}", jdoe), None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConnectionError);

    let results = collect(&app, "j", None, None).await;
    assert!(matches!(results.last(), Some(Err(e)) if e.kind() == ErrorKind::ConnectionError));
}
