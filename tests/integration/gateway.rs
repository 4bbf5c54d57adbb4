//! Queries through the broker: tokenization, token parameters, policy errors.

use serde_json::{json, Value};

use crate::*;

const EMAILS_BY_ID: &str = "SELECT id, lower(email) AS email FROM customers ORDER BY id";

fn column(result: &Value, index: usize) -> Vec<Value> {
    result["result"]["rows"]
        .as_array()
        .expect("rows")
        .iter()
        .map(|row| row[index].clone())
        .collect()
}

#[tokio::test]
async fn tools_list_names_both_tools() {
    let root = temp_root("gateway-tools");
    let broker = TestBroker::start(root.clone(), test_config(&root)).await.unwrap();
    let mut client = broker.connect().await.unwrap();

    let reply = client.request("tools/list", json!({})).await.unwrap();
    let names: Vec<&str> = reply["result"]["tools"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|t| t["name"].as_str())
        .collect();
    assert_eq!(names, vec!["run_sql_query", "run_sql_query_tokens"]);

    drop(client);
    broker.stop().await;
}

#[tokio::test]
async fn deterministic_tokens_repeat_for_equal_values() {
    let root = temp_root("gateway-det");
    let broker = TestBroker::start(root.clone(), test_config(&root)).await.unwrap();
    let mut client = broker.connect().await.unwrap();

    let reply = client.run_sql_query("crm", EMAILS_BY_ID).await.unwrap();
    assert_eq!(reply["result"]["columns"], json!(["id", "email"]));
    assert_eq!(column(&reply, 0), vec![json!("1"), json!("2"), json!("3")]);

    let tokens = column(&reply, 1);
    for token in &tokens {
        let text = token.as_str().unwrap();
        assert!(text.starts_with("tok_crm_"), "{text}");
        assert!(!text.contains('@'));
    }
    assert_eq!(tokens[0], tokens[2], "ada and cleo share an address");
    assert_ne!(tokens[0], tokens[1]);

    // Stable across queries in the same generation.
    let again = client.run_sql_query("crm", EMAILS_BY_ID).await.unwrap();
    assert_eq!(column(&again, 1), tokens);

    drop(client);
    broker.stop().await;
}

#[tokio::test]
async fn randomized_tokens_never_repeat() {
    let root = temp_root("gateway-rand");
    let broker = TestBroker::start(root.clone(), test_config(&root)).await.unwrap();
    let mut client = broker.connect().await.unwrap();

    let first = column(&client.run_sql_query("crm_rand", EMAILS_BY_ID).await.unwrap(), 1);
    let second = column(&client.run_sql_query("crm_rand", EMAILS_BY_ID).await.unwrap(), 1);
    let mut all: Vec<&str> = first.iter().chain(&second).map(|t| t.as_str().unwrap()).collect();
    assert!(all.iter().all(|t| t.starts_with("tok_crm_rand_")));
    all.sort();
    all.dedup();
    assert_eq!(all.len(), 6);

    drop(client);
    broker.stop().await;
}

#[tokio::test]
async fn tokens_filter_without_revealing_values() {
    let root = temp_root("gateway-params");
    let broker = TestBroker::start(root.clone(), test_config(&root)).await.unwrap();
    let mut client = broker.connect().await.unwrap();

    let reply = client.run_sql_query("crm", EMAILS_BY_ID).await.unwrap();
    let ada = column(&reply, 1)[0].as_str().unwrap().to_string();

    let reply = client
        .run_sql_query_tokens("crm", "SELECT name FROM customers WHERE email = ?1 ORDER BY id", &[ada.clone()])
        .await
        .unwrap();
    assert_eq!(reply["result"]["rows"], json!([["ada"], ["cleo"]]));

    // A token from another connection does not resolve here.
    let foreign = ada.replacen("tok_crm_", "tok_crm_rand_", 1);
    let reply = client
        .run_sql_query_tokens("crm", "SELECT name FROM customers WHERE email = ?1", &[foreign])
        .await
        .unwrap();
    assert_eq!(error_data(&reply)["kind"], "invalid_token");

    // Plain text is not a token.
    let reply = client
        .run_sql_query_tokens("crm", "SELECT name FROM customers WHERE email = ?1", &["ada@example.com".to_string()])
        .await
        .unwrap();
    assert_eq!(error_data(&reply)["kind"], "invalid_token");

    // Parameter count bounds.
    let reply = client
        .run_sql_query_tokens("crm", "SELECT name FROM customers WHERE email = ?1", &[])
        .await
        .unwrap();
    assert_eq!(error_data(&reply)["kind"], "invalid_query");

    drop(client);
    broker.stop().await;
}

#[tokio::test]
async fn token_parameters_only_filter_sensitive_columns() {
    let root = temp_root("gateway-param-position");
    let broker = TestBroker::start(root.clone(), test_config(&root)).await.unwrap();
    let mut client = broker.connect().await.unwrap();

    let reply = client.run_sql_query("crm", EMAILS_BY_ID).await.unwrap();
    let ada = column(&reply, 1)[0].as_str().unwrap().to_string();

    for sql in [
        "SELECT ?1",
        "SELECT name FROM customers WHERE name = ?1",
        "SELECT name FROM customers WHERE email = ?1 OR ?1 LIKE 'ada%'",
    ] {
        let reply = client.run_sql_query_tokens("crm", sql, &[ada.clone()]).await.unwrap();
        assert_eq!(error_data(&reply)["kind"], "policy_violation", "{sql}");
        assert!(!reply.to_string().contains("@example.com"), "{sql}");
    }

    let reply = client
        .run_sql_query_tokens("crm", "SELECT name FROM customers WHERE email IN (?1) ORDER BY id", &[ada])
        .await
        .unwrap();
    assert_eq!(reply["result"]["rows"], json!([["ada"], ["cleo"]]));

    drop(client);
    broker.stop().await;
}

#[tokio::test]
async fn policy_errors_name_the_offender() {
    let root = temp_root("gateway-policy");
    let broker = TestBroker::start(root.clone(), test_config(&root)).await.unwrap();
    let mut client = broker.connect().await.unwrap();

    let reply = client.run_sql_query("crm", "SELECT name, email FROM customers").await.unwrap();
    assert_eq!(reply["error"]["code"], -32000);
    let data = error_data(&reply);
    assert_eq!(data["kind"], "sensitive_column");
    assert_eq!(data["connection"], "crm");
    assert_eq!(data["column"], "customers.email");
    assert!(!reply.to_string().contains("@example.com"));

    let reply = client.run_sql_query("crm", "SELECT name FROM customers WHERE ssn LIKE '1%'").await.unwrap();
    assert_eq!(error_data(&reply)["column"], "ssn");

    let reply = client.run_sql_query("crm", "SELECT hex(randomblob(4))").await.unwrap();
    let data = error_data(&reply);
    assert_eq!(data["kind"], "unsafe_function");
    assert_eq!(data["function"], "randomblob");

    let reply = client.run_sql_query("crm", "DELETE FROM customers").await.unwrap();
    assert_eq!(error_data(&reply)["kind"], "policy_violation");

    let reply = client.run_sql_query("nope", "SELECT 1").await.unwrap();
    assert_eq!(error_data(&reply)["kind"], "unknown_connection");

    // Errors never end the session.
    let reply = client.run_sql_query("crm", "SELECT count(*) AS n FROM customers").await.unwrap();
    assert_eq!(reply["result"]["rows"], json!([["3"]]));

    drop(client);
    broker.stop().await;
}

#[tokio::test]
async fn read_only_profile_cannot_write_through_the_backend() {
    let root = temp_root("gateway-ro");
    let broker = TestBroker::start(root.clone(), test_config(&root)).await.unwrap();
    let mut client = broker.connect().await.unwrap();

    let reply = client
        .run_sql_query("crm", "UPDATE customers SET name = 'eve' WHERE id = 1")
        .await
        .unwrap();
    assert!(reply["error"].is_object());

    let reply = client.run_sql_query("crm", "SELECT name FROM customers WHERE id = 1").await.unwrap();
    assert_eq!(reply["result"]["rows"], json!([["ada"]]));

    drop(client);
    broker.stop().await;
}

#[tokio::test]
async fn malformed_requests_get_jsonrpc_errors() {
    let root = temp_root("gateway-rpc");
    let broker = TestBroker::start(root.clone(), test_config(&root)).await.unwrap();
    let mut client = broker.connect().await.unwrap();

    let reply: Value = serde_json::from_slice(&client.call(b"{not json").await.unwrap()).unwrap();
    assert_eq!(reply["error"]["code"], -32700);

    let reply = client.request("resources/list", json!({})).await.unwrap();
    assert_eq!(reply["error"]["code"], -32601);

    let reply = client
        .request("tools/call", json!({ "name": "run_sql_query", "arguments": { "query": "SELECT 1" } }))
        .await
        .unwrap();
    assert_eq!(reply["error"]["code"], -32602);

    let reply = client.run_sql_query("crm", "SELECT 1 AS one").await.unwrap();
    assert_eq!(reply["result"]["rows"], json!([["1"]]));

    drop(client);
    broker.stop().await;
}
