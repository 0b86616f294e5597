use std::sync::Arc;

use leash_api::app::{build_app, services::AppServices};
use leash_auth::memory::StaticAuthenticator;
use leash_core::{NewUser, User};
use reqwest::{StatusCode, header};
use serde_json::{Value, json};
use url::Url;

const IDP: &str = "https://idp.test/authorize";
const APP: &str = "https://app.test/done";

struct TestServer {
    base_url: String,
    services: Arc<AppServices>,
    idp: Arc<StaticAuthenticator>,
    client: reqwest::Client,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn spawn() -> Self {
        // Same router as prod; in-memory stores and a scripted identity provider.
        let idp = Arc::new(StaticAuthenticator::new(IDP));
        let services = Arc::new(AppServices::in_memory(idp.clone()).await.unwrap());
        let app = build_app(services.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap();

        Self {
            base_url,
            services,
            idp,
            client,
            handle,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn user(&self, email: &str, role: &str) -> User {
        self.services
            .store
            .insert_user(NewUser::new(email, "Test User", role).unwrap())
            .await
            .unwrap()
    }

    /// Walk `/auth/login` and `/auth/callback`, returning the callback redirect.
    async fn callback_for(&self, email: &str) -> reqwest::Response {
        let res = self
            .client
            .get(self.url("/auth/login"))
            .query(&[("return", APP), ("state", "opaque-123")])
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::FOUND);
        let state = query_param(location(&res), "state");

        let code = format!("code-for-{email}");
        self.idp.register(code.as_str(), email);
        self.client
            .get(self.url("/auth/callback"))
            .query(&[("code", code.as_str()), ("state", state.as_str())])
            .send()
            .await
            .unwrap()
    }

    async fn login(&self, email: &str) -> String {
        let res = self.callback_for(email).await;
        assert_eq!(res.status(), StatusCode::FOUND);
        query_param(location(&res), "token")
    }

    async fn get(&self, path: &str, auth: Option<&str>) -> reqwest::Response {
        let mut req = self.client.get(self.url(path));
        if let Some(auth) = auth {
            req = req.header(header::AUTHORIZATION, auth);
        }
        req.send().await.unwrap()
    }

    async fn send_json(&self, method: reqwest::Method, path: &str, auth: &str, body: Value) -> reqwest::Response {
        self.client
            .request(method, self.url(path))
            .header(header::AUTHORIZATION, auth)
            .json(&body)
            .send()
            .await
            .unwrap()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn location(res: &reqwest::Response) -> &str {
    res.headers()
        .get(header::LOCATION)
        .expect("redirect without location")
        .to_str()
        .unwrap()
}

fn query_param(url: &str, name: &str) -> String {
    Url::parse(url)
        .unwrap()
        .query_pairs()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.into_owned())
        .unwrap_or_else(|| panic!("{name} missing from {url}"))
}

fn bearer(token: &str) -> String {
    format!("Bearer {token}")
}

#[tokio::test]
async fn health_is_public() {
    let srv = TestServer::spawn().await;
    let res = srv.get("/health", None).await;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.text().await.unwrap(), "ok");
}

#[tokio::test]
async fn login_validate_logout_round_trip() {
    let srv = TestServer::spawn().await;
    srv.user("member@example.org", "member").await;

    let res = srv.callback_for("member@example.org").await;
    assert_eq!(res.status(), StatusCode::FOUND);
    let redirect = location(&res).to_string();
    assert!(redirect.starts_with(APP));
    assert_eq!(query_param(&redirect, "state"), "opaque-123");
    assert!(chrono::DateTime::parse_from_rfc3339(&query_param(&redirect, "expires_at")).is_ok());
    let token = query_param(&redirect, "token");

    let res = srv.get("/auth/validate", Some(&bearer(&token))).await;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.text().await.unwrap(), "Authorized");

    let res = srv
        .client
        .get(srv.url("/auth/logout"))
        .query(&[("token", token.as_str()), ("return", "https://app.test/bye")])
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::FOUND);
    assert_eq!(location(&res), "https://app.test/bye");

    let res = srv.get("/auth/validate", Some(&bearer(&token))).await;
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn validate_without_credentials_is_401() {
    let srv = TestServer::spawn().await;
    let res = srv.get("/auth/validate", None).await;
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn unknown_email_gets_a_retry_page() {
    let srv = TestServer::spawn().await;

    let res = srv.callback_for("stranger@example.org").await;
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    let body = res.text().await.unwrap();
    assert!(body.contains("Retry Login"));
    assert!(body.contains("/auth/login?return=https%3A%2F%2Fapp.test%2Fdone"));
}

#[tokio::test]
async fn tampered_state_or_missing_code_is_400() {
    let srv = TestServer::spawn().await;

    let res = srv
        .client
        .get(srv.url("/auth/callback"))
        .query(&[("code", "anything"), ("state", "not-a-token")])
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let res = srv.get("/auth/callback?state=x", None).await;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let res = srv.get("/auth/logout", None).await;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn refresh_issues_a_working_token() {
    let srv = TestServer::spawn().await;
    srv.user("member@example.org", "member").await;
    let token = srv.login("member@example.org").await;

    let res = srv.get("/auth/refresh", Some(&bearer(&token))).await;
    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    let refreshed = body["token"].as_str().unwrap();
    assert!(body["expires_at"].as_str().is_some());

    let res = srv.get("/auth/validate", Some(&bearer(refreshed))).await;
    assert_eq!(res.status(), StatusCode::OK);

    let res = srv.get("/auth/refresh", None).await;
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn self_and_others_are_gated_by_role() {
    let srv = TestServer::spawn().await;
    let member = srv.user("member@example.org", "member").await;
    srv.user("volunteer@example.org", "volunteer").await;
    srv.user("staff@example.org", "staff").await;

    let member_token = bearer(&srv.login("member@example.org").await);
    let volunteer_token = bearer(&srv.login("volunteer@example.org").await);
    let staff_token = bearer(&srv.login("staff@example.org").await);
    let others = format!("/api/users/{}", member.id);

    // No credential and insufficient permission look the same.
    assert_eq!(srv.get("/api/users/self", None).await.status(), StatusCode::UNAUTHORIZED);

    let res = srv.get("/api/users/self", Some(&member_token)).await;
    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["email"], "member@example.org");
    assert_eq!(body["role"], "member");

    assert_eq!(srv.get(&others, Some(&member_token)).await.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(srv.get(&others, Some(&volunteer_token)).await.status(), StatusCode::OK);
    assert_eq!(srv.get("/api/users/999999", Some(&volunteer_token)).await.status(), StatusCode::NOT_FOUND);
    assert_eq!(srv.get("/api/users/nope", Some(&volunteer_token)).await.status(), StatusCode::BAD_REQUEST);

    let rename = |token: &str| {
        srv.client
            .patch(srv.url(&others))
            .header(header::AUTHORIZATION, token)
            .json(&json!({ "name": "Renamed" }))
            .send()
    };
    assert_eq!(rename(volunteer_token.as_str()).await.unwrap().status(), StatusCode::UNAUTHORIZED);
    let res = rename(staff_token.as_str()).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["name"], "Renamed");
}

#[tokio::test]
async fn permissions_listing_and_overlay_grants() {
    let srv = TestServer::spawn().await;
    let member = srv.user("member@example.org", "member").await;
    srv.user("admin@example.org", "admin").await;
    let member_token = bearer(&srv.login("member@example.org").await);
    let admin_token = bearer(&srv.login("admin@example.org").await);

    let res = srv.get("/api/users/self/permissions", Some(&member_token)).await;
    assert_eq!(res.status(), StatusCode::OK);
    let granted: Vec<String> = res.json().await.unwrap();
    assert!(granted.contains(&"leash:login".to_string()));
    assert!(!granted.contains(&"leash.users:target_others".to_string()));

    // Members cannot look up others until an admin grants it.
    let lookup = "/api/users/get/email/admin@example.org";
    assert_eq!(srv.get(lookup, Some(&member_token)).await.status(), StatusCode::UNAUTHORIZED);

    let res = srv
        .client
        .put(srv.url(&format!("/api/users/{}/permissions", member.id)))
        .header(header::AUTHORIZATION, &admin_token)
        .json(&json!({ "permissions": ["leash.users.get:email"] }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let res = srv.get(lookup, Some(&member_token)).await;
    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["email"], "admin@example.org");

    let res = srv
        .client
        .put(srv.url(&format!("/api/users/{}/permissions", member.id)))
        .header(header::AUTHORIZATION, &admin_token)
        .json(&json!({ "permissions": ["Not A Permission"] }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn checkin_tokens_resolve_for_admins() {
    let srv = TestServer::spawn().await;
    srv.user("member@example.org", "member").await;
    srv.user("admin@example.org", "admin").await;
    let member_token = bearer(&srv.login("member@example.org").await);
    let admin_token = bearer(&srv.login("admin@example.org").await);

    let res = srv.get("/api/users/self/checkin", Some(&member_token)).await;
    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    let checkin = body["token"].as_str().unwrap().to_string();
    assert!(body["expires_at"].as_i64().is_some());

    let path = format!("/api/users/get/checkin/{checkin}");
    assert_eq!(srv.get(&path, Some(&member_token)).await.status(), StatusCode::UNAUTHORIZED);
    let res = srv.get(&path, Some(&admin_token)).await;
    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["email"], "member@example.org");
}

#[tokio::test]
async fn api_keys_carry_their_own_grants() {
    let srv = TestServer::spawn().await;
    srv.user("member@example.org", "member").await;
    let member_token = bearer(&srv.login("member@example.org").await);

    let res = srv
        .client
        .post(srv.url("/api/users/self/apikeys"))
        .header(header::AUTHORIZATION, &member_token)
        .json(&json!({
            "description": "read-only",
            "full_access": false,
            "permissions": ["leash.users:target_self", "leash.users.self:get"],
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);
    let created: Value = res.json().await.unwrap();
    let key = created["key"].as_str().unwrap().to_string();
    assert_eq!(created["permissions"].as_array().unwrap().len(), 2);
    let api_key = format!("API-Key {key}");

    assert_eq!(srv.get("/api/users/self", Some(&api_key)).await.status(), StatusCode::OK);
    assert_eq!(
        srv.get("/api/users/self/permissions", Some(&api_key)).await.status(),
        StatusCode::UNAUTHORIZED
    );

    // Session endpoints are off limits to keys.
    assert_eq!(srv.get("/auth/validate", Some(&api_key)).await.status(), StatusCode::BAD_REQUEST);

    let res = srv.get("/api/users/self/apikeys", Some(&member_token)).await;
    assert_eq!(res.status(), StatusCode::OK);
    let listed: Value = res.json().await.unwrap();
    assert_eq!(listed["total"], 1);
    assert_eq!(listed["data"][0]["key"], key.as_str());

    let res = srv
        .client
        .delete(srv.url(&format!("/api/users/self/apikeys/{key}")))
        .header(header::AUTHORIZATION, &member_token)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NO_CONTENT);
    assert_eq!(srv.get("/api/users/self", Some(&api_key)).await.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn full_access_keys_act_as_their_owner_and_global_routes_need_admin() {
    let srv = TestServer::spawn().await;
    let member = srv.user("member@example.org", "member").await;
    srv.user("admin@example.org", "admin").await;
    let member_token = bearer(&srv.login("member@example.org").await);
    let admin_token = bearer(&srv.login("admin@example.org").await);

    let res = srv
        .send_json(
            reqwest::Method::POST,
            &format!("/api/users/{}/apikeys", member.id),
            &admin_token,
            json!({ "description": "ci", "full_access": true, "permissions": [] }),
        )
        .await;
    assert_eq!(res.status(), StatusCode::CREATED);
    let created: Value = res.json().await.unwrap();
    let key = created["key"].as_str().unwrap().to_string();

    let api_key = format!("API-Key {key}");
    assert_eq!(
        srv.get("/api/users/self/permissions", Some(&api_key)).await.status(),
        StatusCode::OK
    );

    let global = format!("/api/apikeys/{key}");
    assert_eq!(srv.get(&global, Some(&member_token)).await.status(), StatusCode::UNAUTHORIZED);

    let res = srv
        .client
        .patch(srv.url(&global))
        .header(header::AUTHORIZATION, &admin_token)
        .json(&json!({ "full_access": false, "description": "revoked" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let updated: Value = res.json().await.unwrap();
    assert_eq!(updated["full_access"], false);
    assert_eq!(updated["description"], "revoked");

    assert_eq!(
        srv.get("/api/users/self/permissions", Some(&api_key)).await.status(),
        StatusCode::UNAUTHORIZED
    );
    assert_eq!(
        srv.get("/api/apikeys/no-such-key", Some(&admin_token)).await.status(),
        StatusCode::NOT_FOUND
    );
}

#[tokio::test]
async fn a_key_belongs_to_one_user() {
    let srv = TestServer::spawn().await;
    srv.user("a@example.org", "member").await;
    srv.user("b@example.org", "member").await;
    let a_token = bearer(&srv.login("a@example.org").await);
    let b_token = bearer(&srv.login("b@example.org").await);

    let res = srv
        .client
        .post(srv.url("/api/users/self/apikeys"))
        .header(header::AUTHORIZATION, &a_token)
        .json(&json!({ "full_access": false, "permissions": [] }))
        .send()
        .await
        .unwrap();
    let created: Value = res.json().await.unwrap();
    let key = created["key"].as_str().unwrap();

    let res = srv.get(&format!("/api/users/self/apikeys/{key}"), Some(&b_token)).await;
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    let res = srv.get(&format!("/api/users/self/apikeys/{key}"), Some(&a_token)).await;
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn keys_never_carry_more_than_their_owner_holds() {
    let srv = TestServer::spawn().await;
    let victim = srv.user("victim@example.org", "member").await;
    let member = srv.user("member@example.org", "member").await;
    srv.user("staff@example.org", "staff").await;
    srv.user("admin@example.org", "admin").await;
    let member_token = bearer(&srv.login("member@example.org").await);
    let staff_token = bearer(&srv.login("staff@example.org").await);
    let admin_token = bearer(&srv.login("admin@example.org").await);
    let create = "/api/users/self/apikeys";

    // Full access is reserved for admins.
    let res = srv
        .send_json(
            reqwest::Method::POST,
            create,
            &member_token,
            json!({ "full_access": true, "permissions": [] }),
        )
        .await;
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    let reach_others = json!({
        "full_access": false,
        "permissions": ["leash.users:target_others", "leash.users.others:get"],
    });
    let res = srv
        .send_json(reqwest::Method::POST, create, &member_token, reach_others.clone())
        .await;
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    let res = srv.get("/api/users/self/apikeys", Some(&member_token)).await;
    let listed: Value = res.json().await.unwrap();
    assert_eq!(listed["total"], 0);

    // Staff hold those grants, so their key may too.
    let res = srv.send_json(reqwest::Method::POST, create, &staff_token, reach_others).await;
    assert_eq!(res.status(), StatusCode::CREATED);
    let created: Value = res.json().await.unwrap();
    let staff_key = format!("API-Key {}", created["key"].as_str().unwrap());
    let victim_path = format!("/api/users/{}", victim.id);
    assert_eq!(srv.get(&victim_path, Some(&staff_key)).await.status(), StatusCode::OK);

    // A harmless key cannot be widened afterwards.
    let res = srv
        .send_json(
            reqwest::Method::POST,
            create,
            &member_token,
            json!({ "full_access": false, "permissions": ["leash.users.self:get"] }),
        )
        .await;
    assert_eq!(res.status(), StatusCode::CREATED);
    let created: Value = res.json().await.unwrap();
    let key = created["key"].as_str().unwrap().to_string();
    let own_key = format!("/api/users/self/apikeys/{key}");

    let res = srv
        .send_json(reqwest::Method::PATCH, &own_key, &member_token, json!({ "full_access": true }))
        .await;
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    let res = srv
        .send_json(
            reqwest::Method::PATCH,
            &own_key,
            &member_token,
            json!({ "permissions": ["leash.users.others:set_permissions"] }),
        )
        .await;
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    let res = srv.get(&own_key, Some(&member_token)).await;
    let unchanged: Value = res.json().await.unwrap();
    assert_eq!(unchanged["full_access"], false);
    assert_eq!(unchanged["permissions"], json!(["leash.users.self:get"]));

    let key_auth = format!("API-Key {key}");
    let res = srv
        .send_json(
            reqwest::Method::PUT,
            &format!("{victim_path}/permissions"),
            &key_auth,
            json!({ "permissions": ["leash.users.get:checkin"] }),
        )
        .await;
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    // Even an admin cannot hand a member's key a grant the member lacks.
    let res = srv
        .send_json(
            reqwest::Method::POST,
            &format!("/api/users/{}/apikeys", member.id),
            &admin_token,
            json!({ "full_access": false, "permissions": ["leash.users.others:set_permissions"] }),
        )
        .await;
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn admins_create_users() {
    let srv = TestServer::spawn().await;
    srv.user("member@example.org", "member").await;
    srv.user("admin@example.org", "admin").await;
    let member_token = bearer(&srv.login("member@example.org").await);
    let admin_token = bearer(&srv.login("admin@example.org").await);
    let new_user = json!({ "email": "new@example.org", "name": "New", "role": "volunteer" });

    let res = srv
        .send_json(reqwest::Method::POST, "/api/users", &member_token, new_user.clone())
        .await;
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    let res = srv
        .send_json(reqwest::Method::POST, "/api/users", &admin_token, new_user.clone())
        .await;
    assert_eq!(res.status(), StatusCode::CREATED);
    let created: Value = res.json().await.unwrap();
    assert_eq!(created["email"], "new@example.org");
    assert_eq!(created["role"], "volunteer");

    let res = srv.send_json(reqwest::Method::POST, "/api/users", &admin_token, new_user).await;
    assert_eq!(res.status(), StatusCode::CONFLICT);

    for bad in [
        json!({ "email": "other@example.org", "name": "Other", "role": "overlord" }),
        json!({ "email": "not-an-email", "name": "Other", "role": "member" }),
        json!({ "email": "other@example.org", "name": "  ", "role": "member" }),
    ] {
        let res = srv.send_json(reqwest::Method::POST, "/api/users", &admin_token, bad).await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    }

    let token = bearer(&srv.login("new@example.org").await);
    let res = srv.get("/api/users/self", Some(&token)).await;
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["name"], "New");
}

#[tokio::test]
async fn email_changes_wait_for_a_login_through_the_new_address() {
    let srv = TestServer::spawn().await;
    srv.user("member@example.org", "member").await;
    srv.user("taken@example.org", "member").await;
    let token = bearer(&srv.login("member@example.org").await);

    let res = srv
        .send_json(
            reqwest::Method::PATCH,
            "/api/users/self",
            &token,
            json!({ "email": "taken@example.org" }),
        )
        .await;
    assert_eq!(res.status(), StatusCode::CONFLICT);

    let res = srv
        .send_json(
            reqwest::Method::PATCH,
            "/api/users/self",
            &token,
            json!({ "email": "fresh@example.org" }),
        )
        .await;
    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["email"], "member@example.org");
    assert_eq!(body["pending_email"], "fresh@example.org");

    // Asking for the current address again drops the pending one.
    let res = srv
        .send_json(
            reqwest::Method::PATCH,
            "/api/users/self",
            &token,
            json!({ "email": "Member@example.org" }),
        )
        .await;
    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    assert!(body["pending_email"].is_null());

    let res = srv
        .send_json(
            reqwest::Method::PATCH,
            "/api/users/self",
            &token,
            json!({ "email": "fresh@example.org" }),
        )
        .await;
    assert_eq!(res.status(), StatusCode::OK);
    let fresh = bearer(&srv.login("fresh@example.org").await);
    let res = srv.get("/api/users/self", Some(&fresh)).await;
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["email"], "fresh@example.org");
    assert!(body["pending_email"].is_null());
}

#[tokio::test]
async fn role_changes_need_their_own_grant_and_keep_overlay_grants() {
    let srv = TestServer::spawn().await;
    let member = srv.user("member@example.org", "member").await;
    srv.user("staff@example.org", "staff").await;
    srv.user("admin@example.org", "admin").await;
    let member_token = bearer(&srv.login("member@example.org").await);
    let staff_token = bearer(&srv.login("staff@example.org").await);
    let admin_token = bearer(&srv.login("admin@example.org").await);
    let member_path = format!("/api/users/{}", member.id);

    let res = srv
        .send_json(
            reqwest::Method::PUT,
            &format!("{member_path}/permissions"),
            &admin_token,
            json!({ "permissions": ["leash.users.get:checkin"] }),
        )
        .await;
    assert_eq!(res.status(), StatusCode::OK);

    let res = srv
        .send_json(reqwest::Method::PATCH, "/api/users/self", &member_token, json!({ "role": "admin" }))
        .await;
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    // Staff may edit others, but not their role; nothing is half-applied.
    let res = srv
        .send_json(
            reqwest::Method::PATCH,
            &member_path,
            &staff_token,
            json!({ "name": "Promoted", "role": "volunteer" }),
        )
        .await;
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    let res = srv.get(&member_path, Some(&admin_token)).await;
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["name"], "Test User");
    assert_eq!(body["role"], "member");

    let res = srv
        .send_json(reqwest::Method::PATCH, &member_path, &admin_token, json!({ "role": "overlord" }))
        .await;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let res = srv
        .send_json(reqwest::Method::PATCH, &member_path, &admin_token, json!({ "role": "volunteer" }))
        .await;
    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["role"], "volunteer");

    let res = srv.get(&format!("{member_path}/permissions"), Some(&admin_token)).await;
    let granted: Vec<String> = res.json().await.unwrap();
    assert!(granted.contains(&"leash.users.get:checkin".to_string()));
    assert!(granted.contains(&"leash.users:target_others".to_string()));
    assert!(!granted.contains(&"leash.users.others:checkin".to_string()));
}
