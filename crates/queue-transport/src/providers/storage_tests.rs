//! Tests for the storage queue HTTP provider.
//!
//! Request signing and response parsing are tested directly; the queue
//! operations run against a `wiremock` server standing in for the service.

use super::*;
use wiremock::matchers::{body_string_contains, header, header_exists, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

// ============================================================================
// Test Helper Functions
// ============================================================================

const NEXT_VISIBLE: &str = "Fri, 09 Oct 2009 23:29:20 GMT";

fn queue(name: &str) -> QueueName {
    QueueName::new(name.to_string()).unwrap()
}

fn shared_key_factory(server: &MockServer) -> StorageQueueFactory {
    let connection_string = format!(
        "DefaultEndpointsProtocol=http;AccountName=devaccount;AccountKey={};QueueEndpoint={}/devaccount",
        DEVELOPMENT_ACCOUNT_KEY,
        server.uri()
    );
    StorageQueueFactory::from_connection_string(&connection_string).unwrap()
}

fn message_list(text: &str) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"utf-8\"?>\
         <QueueMessagesList>\
           <QueueMessage>\
             <MessageId>5974b586-0df3-4e2d-ad0c-18e3892bfca2</MessageId>\
             <InsertionTime>Fri, 09 Oct 2009 21:04:30 GMT</InsertionTime>\
             <ExpirationTime>Fri, 16 Oct 2009 21:04:30 GMT</ExpirationTime>\
             <PopReceipt>YzQ4Yzg1MDItYTc0Ny00OWNj</PopReceipt>\
             <TimeNextVisible>{}</TimeNextVisible>\
             <DequeueCount>3</DequeueCount>\
             <MessageText>{}</MessageText>\
           </QueueMessage>\
         </QueueMessagesList>",
        NEXT_VISIBLE, text
    )
}

fn error_body(code: &str) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"utf-8\"?><Error><Code>{}</Code>\
         <Message>Failure reported by service.</Message></Error>",
        code
    )
}

// ============================================================================
// Connection String Tests
// ============================================================================

mod connection_string {
    use super::*;

    #[test]
    fn test_derives_endpoint_from_account_and_suffix() {
        let (endpoint, credentials) = parse_connection_string(&format!(
            "DefaultEndpointsProtocol=https;AccountName=myaccount;AccountKey={};EndpointSuffix=core.chinacloudapi.cn",
            DEVELOPMENT_ACCOUNT_KEY
        ))
        .unwrap();

        assert_eq!(
            endpoint.as_str(),
            "https://myaccount.queue.core.chinacloudapi.cn/"
        );
        assert!(matches!(credentials, Credentials::SharedKey(ref s) if s.account == "myaccount"));
    }

    #[test]
    fn test_defaults_to_public_cloud_suffix() {
        let (endpoint, _) = parse_connection_string(&format!(
            "AccountName=myaccount;AccountKey={}",
            DEVELOPMENT_ACCOUNT_KEY
        ))
        .unwrap();

        assert_eq!(endpoint.as_str(), "https://myaccount.queue.core.windows.net/");
    }

    #[test]
    fn test_development_storage() {
        let (endpoint, credentials) =
            parse_connection_string("UseDevelopmentStorage=true").unwrap();

        assert_eq!(endpoint.as_str(), "http://127.0.0.1:10001/devstoreaccount1/");
        assert!(
            matches!(credentials, Credentials::SharedKey(ref s) if s.account == DEVELOPMENT_ACCOUNT)
        );
    }

    #[test]
    fn test_shared_access_signature() {
        let (_, credentials) = parse_connection_string(
            "QueueEndpoint=https://myaccount.queue.core.windows.net;SharedAccessSignature=?sv=2021-12-02&sig=abc",
        )
        .unwrap();

        assert!(
            matches!(credentials, Credentials::SharedAccessSignature(ref sas) if sas.as_str() == "sv=2021-12-02&sig=abc")
        );
    }

    #[test]
    fn test_missing_credentials_are_rejected() {
        let result = parse_connection_string("AccountName=myaccount");
        assert!(matches!(result, Err(ConfigurationError::Missing { ref key }) if key == "AccountKey"));
    }

    #[test]
    fn test_invalid_account_key_is_rejected() {
        let result = parse_connection_string("AccountName=myaccount;AccountKey=not*base64");
        assert!(matches!(result, Err(ConfigurationError::Invalid { .. })));
    }

    #[test]
    fn test_malformed_segment_is_rejected() {
        let result = parse_connection_string("AccountName=myaccount;garbage");
        assert!(matches!(result, Err(ConfigurationError::Parsing { .. })));
    }

    #[test]
    fn test_error_does_not_leak_account_key() {
        let err = match parse_connection_string("AccountName=a;AccountKey=c2VjcmV0;oops") {
            Err(e) => e,
            Ok(_) => panic!("malformed connection string should fail"),
        };
        assert!(!err.to_string().contains("c2VjcmV0"));
    }
}

// ============================================================================
// Shared Key Signature Tests
// ============================================================================

mod signature_tests {
    use super::*;

    fn headers() -> BTreeMap<String, String> {
        let mut headers = BTreeMap::new();
        headers.insert(
            "x-ms-version".to_string(),
            API_VERSION.to_string(),
        );
        headers.insert(
            "x-ms-date".to_string(),
            "Mon, 01 Jan 2024 00:00:00 GMT".to_string(),
        );
        headers
    }

    #[test]
    fn test_string_to_sign_for_get_without_body() {
        let signer = SharedKeySigner::new("acct", DEVELOPMENT_ACCOUNT_KEY).unwrap();
        let url = Url::parse(
            "https://acct.queue.core.windows.net/orders/messages?visibilitytimeout=30&numofmessages=2",
        )
        .unwrap();

        let value = signer.string_to_sign(&Method::GET, &url, &headers(), 0, None);

        let expected = format!(
            "GET{}x-ms-date:Mon, 01 Jan 2024 00:00:00 GMT\n\
             x-ms-version:2021-12-02\n\
             /acct/orders/messages\n\
             numofmessages:2\n\
             visibilitytimeout:30",
            "\n".repeat(12)
        );
        assert_eq!(value, expected);
    }

    #[test]
    fn test_string_to_sign_includes_length_and_content_type() {
        let signer = SharedKeySigner::new("acct", DEVELOPMENT_ACCOUNT_KEY).unwrap();
        let url = Url::parse("https://acct.queue.core.windows.net/orders/messages").unwrap();

        let value = signer.string_to_sign(
            &Method::POST,
            &url,
            &headers(),
            42,
            Some(XML_CONTENT_TYPE),
        );

        assert!(value.starts_with(&format!("POST\n\n\n42\n\n{}\n", XML_CONTENT_TYPE)));
        assert!(value.ends_with("/acct/orders/messages"));
    }

    #[test]
    fn test_signature_is_deterministic_and_key_dependent() {
        let signer = SharedKeySigner::new("acct", DEVELOPMENT_ACCOUNT_KEY).unwrap();
        let other = SharedKeySigner::new("acct", "c2VjcmV0").unwrap();

        assert_eq!(signer.sign("payload"), signer.sign("payload"));
        assert_ne!(signer.sign("payload"), other.sign("payload"));
    }

    #[test]
    fn test_authorization_header_format() {
        let signer = SharedKeySigner::new("acct", DEVELOPMENT_ACCOUNT_KEY).unwrap();
        let url = Url::parse("https://acct.queue.core.windows.net/orders").unwrap();

        let value = signer.authorization(&Method::PUT, &url, &headers(), 0, None);

        assert!(value.starts_with("SharedKey acct:"));
    }
}

// ============================================================================
// Parsing Tests
// ============================================================================

mod parsing_tests {
    use super::*;

    #[test]
    fn test_parse_message_list() {
        let messages = parse_message_list(&message_list("hello &amp; goodbye")).unwrap();

        assert_eq!(messages.len(), 1);
        let message = &messages[0];
        assert_eq!(
            message.message_id.as_str(),
            "5974b586-0df3-4e2d-ad0c-18e3892bfca2"
        );
        assert_eq!(message.pop_receipt.as_str(), "YzQ4Yzg1MDItYTc0Ny00OWNj");
        assert_eq!(message.dequeue_count, 3);
        assert_eq!(message.text, "hello & goodbye");
        assert_eq!(
            message.time_next_visible,
            "2009-10-09T23:29:20Z".parse::<Timestamp>().unwrap()
        );
    }

    #[test]
    fn test_parse_empty_message_list() {
        let messages = parse_message_list(
            "<?xml version=\"1.0\" encoding=\"utf-8\"?><QueueMessagesList></QueueMessagesList>",
        )
        .unwrap();
        assert!(messages.is_empty());
    }

    #[test]
    fn test_parse_message_without_pop_receipt_fails() {
        let xml = "<QueueMessagesList><QueueMessage><MessageId>m1</MessageId>\
                   <TimeNextVisible>Fri, 09 Oct 2009 23:29:20 GMT</TimeNextVisible>\
                   </QueueMessage></QueueMessagesList>";
        assert!(matches!(
            parse_message_list(xml),
            Err(StorageError::InvalidResponse(_))
        ));
    }

    #[test]
    fn test_parse_error_xml() {
        let (code, message) = parse_error_xml(&error_body("QueueNotFound"));
        assert_eq!(code.as_deref(), Some("QueueNotFound"));
        assert_eq!(message.as_deref(), Some("Failure reported by service."));

        assert_eq!(parse_error_xml(""), (None, None));
    }

    #[test]
    fn test_whole_seconds_rounds_up_and_clamps() {
        assert_eq!(whole_seconds(Duration::milliseconds(4_001), 0), 5);
        assert_eq!(whole_seconds(Duration::seconds(5), 0), 5);
        assert_eq!(whole_seconds(Duration::zero(), 1), 1);
        assert_eq!(whole_seconds(Duration::seconds(-10), 0), 0);
        assert_eq!(
            whole_seconds(Duration::days(30), 0),
            MAX_VISIBILITY_SECONDS
        );
    }

    #[test]
    fn test_message_encoding_from_str() {
        assert_eq!("base64".parse::<MessageEncoding>().unwrap(), MessageEncoding::Base64);
        assert_eq!("Text".parse::<MessageEncoding>().unwrap(), MessageEncoding::Text);
        assert!("rot13".parse::<MessageEncoding>().is_err());
    }
}

// ============================================================================
// Queue Operation Tests
// ============================================================================

mod operations {
    use super::*;

    #[tokio::test]
    async fn test_create_if_missing_sends_signed_put() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/devaccount/orders"))
            .and(header("x-ms-version", API_VERSION))
            .and(header_exists("x-ms-date"))
            .and(header_exists("authorization"))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let factory = shared_key_factory(&server);
        let client = factory.client(&queue("orders"));

        client.create_if_missing().await.unwrap();
    }

    #[tokio::test]
    async fn test_create_if_missing_tolerates_existing_queue() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/devaccount/orders"))
            .respond_with(
                ResponseTemplate::new(409)
                    .insert_header("x-ms-error-code", "QueueAlreadyExists")
                    .set_body_string(error_body("QueueAlreadyExists")),
            )
            .mount(&server)
            .await;

        let client = shared_key_factory(&server).client(&queue("orders"));

        assert!(client.create_if_missing().await.is_ok());
    }

    #[tokio::test]
    async fn test_exists_maps_queue_not_found_to_false() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/devaccount/missing"))
            .and(query_param("comp", "metadata"))
            .respond_with(
                ResponseTemplate::new(404)
                    .insert_header("x-ms-error-code", "QueueNotFound")
                    .set_body_string(error_body("QueueNotFound")),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/devaccount/orders"))
            .and(query_param("comp", "metadata"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let factory = shared_key_factory(&server);

        assert!(!factory.client(&queue("missing")).exists().await.unwrap());
        assert!(factory.client(&queue("orders")).exists().await.unwrap());
    }

    #[tokio::test]
    async fn test_enqueue_posts_escaped_text_with_delay_and_ttl() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/devaccount/orders/messages"))
            .and(query_param("visibilitytimeout", "5"))
            .and(query_param("messagettl", "60"))
            .and(body_string_contains(
                "<QueueMessage><MessageText>{&quot;Body&quot;:&quot;aGk=&quot;}</MessageText></QueueMessage>",
            ))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let client = shared_key_factory(&server).client(&queue("orders"));

        client
            .enqueue(
                Bytes::from_static(br#"{"Body":"aGk="}"#),
                Some(Duration::seconds(60)),
                Some(Duration::milliseconds(4_500)),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_enqueue_rejects_oversized_message_without_request() {
        let server = MockServer::start().await;
        let client = shared_key_factory(&server).client(&queue("orders"));

        let result = client
            .enqueue(Bytes::from(vec![b'a'; MAX_MESSAGE_SIZE + 1]), None, None)
            .await;

        assert!(matches!(result, Err(QueueError::MessageTooLarge { .. })));
    }

    #[tokio::test]
    async fn test_enqueue_rejects_delay_beyond_seven_days_without_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(201))
            .expect(0)
            .mount(&server)
            .await;

        let client = shared_key_factory(&server).client(&queue("orders"));

        let result = client
            .enqueue(Bytes::from_static(b"{}"), None, Some(Duration::days(10)))
            .await;

        match result {
            Err(QueueError::ValidationError(ValidationError::OutOfRange { field, .. })) => {
                assert_eq!(field, "initial_delay");
            }
            other => panic!("expected out-of-range delay, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_enqueue_accepts_delay_of_exactly_seven_days() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/devaccount/orders/messages"))
            .and(query_param("visibilitytimeout", "604800"))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let client = shared_key_factory(&server).client(&queue("orders"));

        client
            .enqueue(Bytes::from_static(b"{}"), None, Some(Duration::days(7)))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_enqueue_base64_encoding() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/devaccount/orders/messages"))
            .and(body_string_contains("<MessageText>AP8=</MessageText>"))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let factory = shared_key_factory(&server)
            .with_message_encoding(MessageEncoding::Base64)
            .unwrap();

        factory
            .client(&queue("orders"))
            .enqueue(Bytes::from_static(&[0x00, 0xff]), None, None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_lease_one_parses_leased_message() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/devaccount/orders/messages"))
            .and(query_param("numofmessages", "1"))
            .and(query_param("visibilitytimeout", "300"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(message_list("{&quot;Body&quot;:&quot;aGk=&quot;}")),
            )
            .mount(&server)
            .await;

        let client = shared_key_factory(&server).client(&queue("orders"));

        let leased = client
            .lease_one(Duration::minutes(5))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(leased.lease_token.as_str(), "YzQ4Yzg1MDItYTc0Ny00OWNj");
        assert_eq!(leased.dequeue_count, 3);
        assert_eq!(leased.payload.as_ref(), br#"{"Body":"aGk="}"#);
    }

    #[tokio::test]
    async fn test_lease_many_caps_batch_size() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/devaccount/orders/messages"))
            .and(query_param("numofmessages", "32"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "<?xml version=\"1.0\" encoding=\"utf-8\"?><QueueMessagesList></QueueMessagesList>",
            ))
            .expect(1)
            .mount(&server)
            .await;

        let client = shared_key_factory(&server).client(&queue("orders"));

        let batch = client.lease_many(100, Duration::seconds(30)).await.unwrap();
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn test_extend_lease_returns_rotated_receipt() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/devaccount/orders/messages/m-1"))
            .and(query_param("popreceipt", "old-receipt"))
            .and(query_param("visibilitytimeout", "0"))
            .respond_with(
                ResponseTemplate::new(204)
                    .insert_header("x-ms-popreceipt", "new-receipt")
                    .insert_header("x-ms-time-next-visible", NEXT_VISIBLE),
            )
            .mount(&server)
            .await;

        let client = shared_key_factory(&server).client(&queue("orders"));

        let extension = client
            .extend_lease(
                &"m-1".parse().unwrap(),
                &LeaseToken::new("old-receipt"),
                Duration::zero(),
            )
            .await
            .unwrap();

        assert_eq!(extension.lease_token.as_str(), "new-receipt");
        assert_eq!(
            extension.next_visible_on,
            "2009-10-09T23:29:20Z".parse::<Timestamp>().unwrap()
        );
    }

    #[tokio::test]
    async fn test_delete_with_stale_receipt_maps_to_message_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/devaccount/orders/messages/m-1"))
            .and(query_param("popreceipt", "stale"))
            .respond_with(
                ResponseTemplate::new(400)
                    .insert_header("x-ms-error-code", "PopReceiptMismatch")
                    .set_body_string(error_body("PopReceiptMismatch")),
            )
            .mount(&server)
            .await;

        let client = shared_key_factory(&server).client(&queue("orders"));

        let result = client
            .delete(&"m-1".parse().unwrap(), &LeaseToken::new("stale"))
            .await;

        assert!(
            matches!(result, Err(QueueError::MessageNotFound { ref lease_token }) if lease_token == "stale")
        );
    }

    #[tokio::test]
    async fn test_clear_all_deletes_messages_collection() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/devaccount/orders/messages"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let client = shared_key_factory(&server).client(&queue("orders"));

        client.clear_all().await.unwrap();
    }

    #[tokio::test]
    async fn test_forbidden_maps_to_authentication_failure() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/devaccount/orders/messages"))
            .respond_with(
                ResponseTemplate::new(403).set_body_string(error_body("AuthenticationFailed")),
            )
            .mount(&server)
            .await;

        let client = shared_key_factory(&server).client(&queue("orders"));

        let result = client.clear_all().await;
        assert!(matches!(result, Err(QueueError::AuthenticationFailed { .. })));
    }

    #[tokio::test]
    async fn test_server_error_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/devaccount/orders/messages"))
            .respond_with(
                ResponseTemplate::new(503).set_body_string(error_body("ServerBusy")),
            )
            .mount(&server)
            .await;

        let client = shared_key_factory(&server).client(&queue("orders"));

        let err = client.clear_all().await.unwrap_err();
        assert!(err.is_transient());
        assert!(matches!(err, QueueError::ProviderError { ref code, .. } if code == "ServerBusy"));
    }
}

// ============================================================================
// Alternative Credential Tests
// ============================================================================

mod credentials {
    use super::*;

    #[tokio::test]
    async fn test_token_credential_sends_bearer_token() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/devaccount/orders/messages"))
            .and(header("authorization", "Bearer token-123"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let factory = StorageQueueFactory::with_token_credential(
            &format!("{}/devaccount", server.uri()),
            Arc::new(StaticTokenCredential::new("token-123")),
        )
        .unwrap();

        factory.client(&queue("orders")).clear_all().await.unwrap();
    }

    #[tokio::test]
    async fn test_shared_access_signature_is_appended_to_query() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/devaccount/orders/messages"))
            .and(query_param("sv", "2021-12-02"))
            .and(query_param("sig", "abc"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let factory = StorageQueueFactory::from_connection_string(&format!(
            "QueueEndpoint={}/devaccount;SharedAccessSignature=sv=2021-12-02&sig=abc",
            server.uri()
        ))
        .unwrap();

        factory.client(&queue("orders")).clear_all().await.unwrap();
    }

    #[test]
    fn test_factory_caches_clients_per_queue() {
        let factory =
            StorageQueueFactory::from_connection_string("UseDevelopmentStorage=true").unwrap();

        let first = factory.client(&queue("orders"));
        let second = factory.client(&queue("orders"));

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(
            factory.endpoint().as_str(),
            "http://127.0.0.1:10001/devstoreaccount1/"
        );
    }

    #[test]
    fn test_settings_cannot_change_after_clients_are_handed_out() {
        let factory =
            StorageQueueFactory::from_connection_string("UseDevelopmentStorage=true").unwrap();
        let _client = factory.client(&queue("orders"));

        assert!(factory
            .with_message_encoding(MessageEncoding::Base64)
            .is_err());
    }
}
