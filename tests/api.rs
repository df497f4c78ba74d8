//! Exercises the process-wide API. Everything runs in one test since the instance is shared.
use std::{collections::HashMap, sync::Arc, time::Duration};

use flagbridge::{
    event_callback, CallContext, CancellationToken, Error, ErrorCode, EvaluationContext,
    EventType, FeatureProvider, InMemoryFlag, InMemoryProvider, NoopProvider, ProviderStatus,
    Reason,
};

fn flags() -> HashMap<String, InMemoryFlag> {
    HashMap::from([
        (
            "new-checkout".to_owned(),
            InMemoryFlag::new("off", [("on", true.into()), ("off", false.into())])
                .with_context_evaluator(|context| {
                    context
                        .get("plan")
                        .and_then(|plan| plan.as_str())
                        .filter(|plan| *plan == "pro")
                        .map(|_| "on".to_owned())
                }),
        ),
        (
            "retries".to_owned(),
            InMemoryFlag::new("default", [("default", 3i64.into())]),
        ),
    ])
}

#[tokio::test]
async fn global_api_lifecycle() {
    let _ = env_logger::builder().is_test(true).try_init();

    assert_eq!(flagbridge::provider_metadata().name, NoopProvider::NAME);
    assert_eq!(
        flagbridge::set_provider(CancellationToken::new(), None::<Arc<InMemoryProvider>>),
        Err(Error::InvalidProvider)
    );

    let (tx, mut ready) = tokio::sync::mpsc::unbounded_channel();
    let callback = event_callback(move |details| {
        let _ = tx.send(details.provider_name.clone());
    });
    flagbridge::add_handler(EventType::ProviderReady, callback.clone());

    let provider = Arc::new(InMemoryProvider::new(flags()));
    flagbridge::set_provider_and_wait(CancellationToken::new(), provider.clone())
        .await
        .unwrap();

    let name = tokio::time::timeout(Duration::from_secs(5), ready.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(name, InMemoryProvider::NAME);
    flagbridge::remove_handler(EventType::ProviderReady, &callback);

    let client = flagbridge::client("checkout");
    assert_eq!(client.provider_status(), ProviderStatus::Ready);

    // Transaction context set by request middleware reaches the provider.
    let ctx = CallContext::new().merge_transaction_context(EvaluationContext::new(
        "user-1",
        [("plan".to_owned(), "pro".into())].into_iter().collect(),
    ));
    let details = client.boolean_details(&ctx, "new-checkout", false, None, None);
    assert!(details.value);
    assert_eq!(details.reason, Some(Reason::TargetingMatch));
    assert!(!client
        .boolean_value(&CallContext::new(), "new-checkout", true, None, None)
        .unwrap());

    assert_eq!(
        client
            .int_value(&CallContext::new(), "retries", 0, None, None)
            .unwrap(),
        3
    );
    let details = client.float_details(&CallContext::new(), "missing", 0.5, None, None);
    assert_eq!(details.value, 0.5);
    assert_eq!(details.error_code, Some(ErrorCode::FlagNotFound));

    // A named provider takes over the domain.
    flagbridge::set_named_provider_and_wait(
        CancellationToken::new(),
        "checkout",
        Arc::new(NoopProvider),
    )
    .await
    .unwrap();
    assert_eq!(
        flagbridge::named_provider_metadata("checkout").name,
        NoopProvider::NAME
    );
    let details = client.int_details(&CallContext::new(), "retries", 0, None, None);
    assert_eq!((details.value, details.reason), (0, Some(Reason::Default)));

    flagbridge::shutdown(CancellationToken::new()).await.unwrap();
    flagbridge::shutdown(CancellationToken::new()).await.unwrap();
    assert_eq!(
        flagbridge::provider_status("checkout"),
        ProviderStatus::NotReady
    );
    assert_eq!(
        flagbridge::provider_metadata().name,
        NoopProvider.metadata().name
    );
}
