use std::{collections::HashMap, sync::Arc};

use flagbridge::{
    event_callback, CallContext, CancellationToken, EvaluationContext, EventType, InMemoryFlag,
    InMemoryProvider,
};

#[tokio::main(flavor = "current_thread")]
async fn main() -> flagbridge::Result<()> {
    // Configure env_logger to see flagbridge logs.
    env_logger::Builder::from_env(env_logger::Env::new().default_filter_or("flagbridge")).init();

    flagbridge::add_handler(
        EventType::ProviderConfigurationChanged,
        event_callback(|details| {
            println!("flags changed: {:?}", details.flags_changed);
        }),
    );

    let provider = Arc::new(InMemoryProvider::new(HashMap::from([(
        "banner-color".to_owned(),
        InMemoryFlag::new("blue", [("blue", "#0000ff".into()), ("red", "#ff0000".into())])
            .with_context_evaluator(|context| {
                context
                    .get("country")
                    .and_then(|country| country.as_str())
                    .filter(|country| *country == "CA")
                    .map(|_| "red".to_owned())
            }),
    )])));
    flagbridge::set_provider_and_wait(CancellationToken::new(), provider.clone()).await?;

    let client = flagbridge::client("web");
    for country in ["US", "CA"] {
        let context = EvaluationContext::new(
            "user-1",
            [("country".to_owned(), country.into())].into_iter().collect(),
        );
        let details =
            client.string_details(&CallContext::new(), "banner-color", "#000000", Some(&context), None);
        println!(
            "{country}: {} (variant {:?}, reason {:?})",
            details.value, details.variant, details.reason
        );
    }

    provider.update_flags(HashMap::from([(
        "banner-color".to_owned(),
        InMemoryFlag::new("green", [("green", "#00ff00".into())]),
    )]));
    // Give the dispatcher a moment to deliver the change event before shutting down.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    flagbridge::shutdown(CancellationToken::new()).await
}
