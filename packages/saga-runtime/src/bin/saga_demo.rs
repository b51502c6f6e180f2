//! Saga Demo
//!
//! Runs an order saga against the in-memory broker: reserve stock through an
//! inventory service listening on the log, charge a card, and roll the
//! reservation back when the charge is declined.

use std::sync::Arc;

use anyhow::{Context, Result};
use futures::StreamExt;
use saga_runtime::broker::{BrokerClient, BrokerConsumer};
use saga_runtime::{
    Action, Callable, CompensationConfig, CompensationHandler, CompensationPlan, InMemoryBroker,
    RuntimeConfig, SagaOptions, SagaRuntimeBuilder, TracingMiddleware, TransactionId, Workflow,
};
use serde_json::{json, Value};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const CARD_LIMIT: i64 = 100;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,saga_runtime=debug".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_line_number(true),
        )
        .init();

    tracing::info!("Starting saga demo");

    let config = RuntimeConfig::from_env().context("Failed to load configuration")?;
    tracing::info!(
        delivery_mode = ?config.delivery_mode,
        flush_interval_ms = config.flush_interval.as_millis() as u64,
        "Configuration loaded"
    );

    let broker = InMemoryBroker::new();
    let runtime = SagaRuntimeBuilder::new(Arc::new(broker.clone()))
        .with_config(config)
        .with_middleware(TracingMiddleware)
        .build();
    runtime.connect().await.context("Failed to connect runtime")?;

    spawn_inventory_service(&broker).await?;

    let workflow = order_workflow();
    for (tx, amount) in [("order-1", 40), ("order-2", 250)] {
        let action = Action::new(
            "orders.created",
            TransactionId::from(tx),
            json!({"sku": "widget", "amount": amount}),
        );
        match runtime
            .run_saga(&workflow, action, SagaOptions::default())
            .await
        {
            Ok(result) => tracing::info!(transaction_id = tx, %result, "Order finished"),
            Err(e) => tracing::error!(transaction_id = tx, error = %e, "Order failed"),
        }
    }

    tracing::info!(
        reserved = broker.records("inventory.reserve").len(),
        released = broker.records("inventory.release").len(),
        "Inventory traffic"
    );

    runtime.disconnect().await.context("Failed to disconnect runtime")?;
    Ok(())
}

fn order_workflow() -> Workflow {
    let charge = Callable::from_async("charge_card", |args: Vec<Value>| async move {
        let amount = args.first().and_then(Value::as_i64).unwrap_or_default();
        if amount > CARD_LIMIT {
            anyhow::bail!("card declined for amount {amount}");
        }
        Ok(json!({"charged": amount}))
    });
    let notify_customer = CompensationHandler::from_async(|payload: Value| async move {
        tracing::info!(%payload, "Customer notified of cancelled order");
        Ok(Value::Null)
    });

    Workflow::new("order", move |action, ctx| {
        let charge = charge.clone();
        let notify_customer = notify_customer.clone();
        async move {
            let order = action.into_payload();

            let replies = ctx.action_channel("inventory.reserved").await?;
            ctx.put("inventory.reserve", json!({"sku": order["sku"]}))
                .await?;
            let reservation = ctx.take_from(&replies).await?;

            ctx.add_compensation(CompensationPlan::immediate(
                notify_customer,
                json!({"order": order.clone()}),
            ))
            .await?;
            ctx.add_compensation(CompensationPlan::remote(
                "inventory.release",
                reservation.payload().clone(),
            ))
            .await?;

            match ctx.call(&charge, vec![order["amount"].clone()]).await {
                Ok(receipt) => Ok(json!({"status": "confirmed", "receipt": receipt})),
                Err(e) => {
                    tracing::warn!(error = %e, "Charge failed, rolling back");
                    ctx.run_compensation(CompensationConfig::default()).await?;
                    Ok(json!({"status": "rolled_back", "reason": e.to_string()}))
                }
            }
        }
    })
}

/// Reply to every reservation request on the same transaction.
async fn spawn_inventory_service(broker: &InMemoryBroker) -> Result<()> {
    let mut requests = broker
        .consumer("inventory-service")
        .subscribe("inventory.reserve")
        .await
        .context("Failed to subscribe inventory service")?;
    let broker = broker.clone();

    tokio::spawn(async move {
        while let Some(record) = requests.next().await {
            let request = match Action::from_record(&record) {
                Ok(request) => request,
                Err(e) => {
                    tracing::error!(error = %e, "Inventory service skipped a record");
                    continue;
                }
            };
            let reply = Action::new(
                "inventory.reserved",
                request.transaction_id().clone(),
                json!({"sku": request.payload()["sku"], "slot": record.offset}),
            );
            broker.append("inventory.reserved", reply.to_outbound());
        }
    });
    Ok(())
}
