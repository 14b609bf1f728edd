//! IB Client Portal gateway adapter.
//!
//! All broker traffic goes through the locally running CP gateway REST
//! API. The gateway serves a self-signed certificate on localhost, so
//! the HTTP client accepts invalid certs for that host only by
//! configuration. Asynchronous order/connectivity events are produced
//! by a polling pump (`run_event_pump`) and drained by the daemon.

use anyhow::{anyhow, Context, Result};
use chrono::{NaiveDate, Utc};
use parking_lot::Mutex;
use reqwest::Client;
use serde::Deserialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::{
    BracketRefs, BracketTicket, BrokerAdapter, BrokerEvent, BrokerOrderStatus, BrokerPosition,
    ChainEntry, ExecutionFill, MarginImpact, OptionContract, OrderRef, OrderTicket,
};
use crate::config::BrokerConfig;
use crate::models::{AccountSummary, Greeks, OptionRight, OrderSide, Quote};

// CP gateway market data snapshot field ids
const FIELD_LAST: &str = "31";
const FIELD_BID: &str = "84";
const FIELD_ASK: &str = "86";
const FIELD_VOLUME: &str = "87";
const FIELD_DELTA: &str = "7308";
const FIELD_GAMMA: &str = "7309";
const FIELD_THETA: &str = "7310";
const FIELD_IV: &str = "7633";
const FIELD_OPEN_INTEREST: &str = "7638";

struct IbkrShared {
    events: Mutex<VecDeque<BrokerEvent>>,
    /// occ symbol -> conid
    contract_cache: Mutex<HashMap<String, String>>,
    /// underlying symbol -> conid
    underlying_cache: Mutex<HashMap<String, String>>,
    /// broker order id -> last observed (status, filled)
    order_watch: Mutex<HashMap<String, (String, i64)>>,
    connected: Mutex<bool>,
}

#[derive(Clone)]
pub struct IbkrAdapter {
    http: Client,
    base_url: String,
    account_id: String,
    config: BrokerConfig,
    shared: Arc<IbkrShared>,
}

impl IbkrAdapter {
    pub fn new(config: BrokerConfig) -> Result<Self> {
        if config.account_id.trim().is_empty() {
            return Err(anyhow!("IBKR_ACCOUNT_ID missing (set env var)"));
        }
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            // CP gateway runs on localhost with a self-signed cert
            .danger_accept_invalid_certs(true)
            .pool_max_idle_per_host(4)
            .build()
            .context("Failed to build IBKR http client")?;

        Ok(Self {
            http,
            base_url: config.gateway_url.trim_end_matches('/').to_string(),
            account_id: config.account_id.clone(),
            config,
            shared: Arc::new(IbkrShared {
                events: Mutex::new(VecDeque::new()),
                contract_cache: Mutex::new(HashMap::new()),
                underlying_cache: Mutex::new(HashMap::new()),
                order_watch: Mutex::new(HashMap::new()),
                connected: Mutex::new(true),
            }),
        })
    }

    #[inline]
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
        timeout: Duration,
    ) -> Result<T> {
        let resp = self
            .http
            .get(self.url(path))
            .query(query)
            .timeout(timeout)
            .send()
            .await
            .with_context(|| format!("GET {path} failed"))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let snippet: String = text.chars().take(400).collect();
            return Err(anyhow!("GET {path} {}: {}", status.as_u16(), snippet));
        }
        resp.json::<T>()
            .await
            .with_context(|| format!("parse {path} response"))
    }

    async fn post_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &serde_json::Value,
        timeout: Duration,
    ) -> Result<T> {
        let resp = self
            .http
            .post(self.url(path))
            .json(body)
            .timeout(timeout)
            .send()
            .await
            .with_context(|| format!("POST {path} failed"))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let snippet: String = text.chars().take(400).collect();
            return Err(anyhow!("POST {path} {}: {}", status.as_u16(), snippet));
        }
        resp.json::<T>()
            .await
            .with_context(|| format!("parse {path} response"))
    }

    async fn underlying_conid(&self, symbol: &str) -> Result<String> {
        if let Some(conid) = self.shared.underlying_cache.lock().get(symbol) {
            return Ok(conid.clone());
        }

        #[derive(Deserialize)]
        struct SearchRow {
            conid: serde_json::Value,
            #[serde(default)]
            symbol: Option<String>,
        }

        let rows: Vec<SearchRow> = self
            .get_json(
                "/iserver/secdef/search",
                &[("symbol", symbol.to_string())],
                Duration::from_secs(self.config.chain_timeout_secs),
            )
            .await?;
        let row = rows
            .into_iter()
            .find(|r| r.symbol.as_deref() == Some(symbol))
            .ok_or_else(|| anyhow!("no conid found for underlying {symbol}"))?;
        let conid = json_to_string(&row.conid);
        self.shared
            .underlying_cache
            .lock()
            .insert(symbol.to_string(), conid.clone());
        Ok(conid)
    }

    /// One snapshot request for a set of conids. The gateway streams
    /// snapshot fields; absent fields simply stay `None`.
    async fn snapshot(
        &self,
        conids: &[String],
        fields: &[&str],
        timeout: Duration,
    ) -> Result<Vec<HashMap<String, serde_json::Value>>> {
        self.get_json(
            "/iserver/marketdata/snapshot",
            &[
                ("conids", conids.join(",")),
                ("fields", fields.join(",")),
            ],
            timeout,
        )
        .await
    }

    async fn quote_for_conid(&self, conid: &str) -> Result<Quote> {
        let rows = self
            .snapshot(
                &[conid.to_string()],
                &[FIELD_LAST, FIELD_BID, FIELD_ASK],
                Duration::from_secs(self.config.quote_timeout_secs),
            )
            .await?;
        let row = rows.first().ok_or_else(|| anyhow!("empty snapshot"))?;
        let bid = field_f64(row, FIELD_BID);
        let ask = field_f64(row, FIELD_ASK);
        let last = field_f64(row, FIELD_LAST);
        match (bid, ask) {
            (Some(bid), Some(ask)) if bid > 0.0 && ask > 0.0 => Ok(Quote {
                bid,
                ask,
                last,
                ts: Utc::now(),
            }),
            _ => Err(anyhow!("snapshot missing bid/ask for conid {conid}")),
        }
    }

    async fn resolve_contract(&self, contract: &OptionContract) -> Result<String> {
        if let Some(conid) = &contract.conid {
            return Ok(conid.clone());
        }
        let key = contract.occ_symbol();
        if let Some(conid) = self.shared.contract_cache.lock().get(&key) {
            return Ok(conid.clone());
        }

        let underlying = self.underlying_conid(&contract.symbol).await?;

        #[derive(Deserialize)]
        struct InfoRow {
            conid: serde_json::Value,
            #[serde(default)]
            #[serde(rename = "maturityDate")]
            maturity_date: Option<String>,
        }

        let month = contract.expiration.format("%b%y").to_string().to_uppercase();
        let rows: Vec<InfoRow> = self
            .get_json(
                "/iserver/secdef/info",
                &[
                    ("conid", underlying),
                    ("sectype", "OPT".to_string()),
                    ("month", month),
                    ("strike", format!("{}", contract.strike)),
                    ("right", contract.right.as_str().to_string()),
                ],
                Duration::from_secs(self.config.chain_timeout_secs),
            )
            .await?;

        let wanted = contract.expiration.format("%Y%m%d").to_string();
        let row = rows
            .into_iter()
            .find(|r| r.maturity_date.as_deref() == Some(wanted.as_str()))
            .ok_or_else(|| anyhow!("no contract for {key}"))?;
        let conid = json_to_string(&row.conid);
        self.shared.contract_cache.lock().insert(key, conid.clone());
        Ok(conid)
    }

    fn order_payload(
        &self,
        conid: &str,
        ticket: &OrderTicket,
        coid: Option<&str>,
        parent_id: Option<&str>,
    ) -> serde_json::Value {
        let mut order = serde_json::json!({
            "conid": conid.parse::<i64>().unwrap_or(0),
            "orderType": ticket.kind.as_str(),
            "price": ticket.limit_price,
            "side": ticket.side.as_str(),
            "tif": ticket.tif.as_str(),
            "quantity": ticket.quantity,
        });
        if let Some(coid) = coid {
            order["cOID"] = serde_json::json!(coid);
        }
        if let Some(parent) = parent_id {
            order["parentId"] = serde_json::json!(parent);
        }
        order
    }

    /// Submit an order list, answering the gateway's confirmation
    /// prompts (precautionary warnings) until an order id comes back.
    async fn submit_orders(&self, orders: Vec<serde_json::Value>) -> Result<Vec<OrderRef>> {
        #[derive(Deserialize)]
        struct SubmitRow {
            #[serde(default)]
            order_id: Option<String>,
            #[serde(default)]
            order_status: Option<String>,
            #[serde(default)]
            id: Option<String>,
            #[serde(default)]
            message: Option<Vec<String>>,
        }

        let path = format!("/iserver/account/{}/orders", self.account_id);
        let body = serde_json::json!({ "orders": orders });
        let mut rows: Vec<SubmitRow> = self
            .post_json(&path, &body, Duration::from_secs(self.config.submit_timeout_secs))
            .await?;

        // the gateway may interpose up to a few confirmation prompts
        for _ in 0..3 {
            let Some(first) = rows.first() else { break };
            let Some(reply_id) = first.id.clone() else { break };
            if first.order_id.is_some() {
                break;
            }
            debug!(messages = ?first.message, "confirming order prompt");
            let reply_path = format!("/iserver/reply/{reply_id}");
            rows = self
                .post_json(
                    &reply_path,
                    &serde_json::json!({ "confirmed": true }),
                    Duration::from_secs(self.config.submit_timeout_secs),
                )
                .await?;
        }

        let refs: Vec<OrderRef> = rows
            .into_iter()
            .filter_map(|r| {
                r.order_id.map(|id| OrderRef {
                    broker_order_id: id,
                    status: r.order_status.unwrap_or_else(|| "Submitted".to_string()),
                })
            })
            .collect();
        if refs.is_empty() {
            return Err(anyhow!("gateway returned no order ids"));
        }
        Ok(refs)
    }

    fn push_event(&self, event: BrokerEvent) {
        self.shared.events.lock().push_back(event);
    }

    fn set_connected(&self, connected: bool) {
        let mut flag = self.shared.connected.lock();
        if *flag != connected {
            *flag = connected;
            if connected {
                info!("🔌 gateway connection restored");
                self.push_event(BrokerEvent::Reconnected);
            } else {
                warn!("🔌 gateway connection lost");
                self.push_event(BrokerEvent::Disconnected);
            }
        }
    }

    /// Polling pump: keeps the gateway session alive, watches order
    /// status transitions and connectivity. Fills observed here are
    /// queued as events, never acted on inline.
    pub async fn run_event_pump(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.config.poll_interval_secs.max(1)));
        info!("broker event pump started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.poll_once().await {
                        debug!("broker poll failed: {e:#}");
                        self.set_connected(false);
                    } else {
                        self.set_connected(true);
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    async fn poll_once(&self) -> Result<()> {
        // tickle keeps the session alive and proves connectivity
        let _: serde_json::Value = self
            .post_json(
                "/tickle",
                &serde_json::json!({}),
                Duration::from_secs(self.config.quote_timeout_secs),
            )
            .await?;

        let orders = self.list_open_orders_inner().await?;
        let mut watch = self.shared.order_watch.lock();
        for status in orders {
            let seen = watch
                .get(&status.broker_order_id)
                .cloned()
                .unwrap_or_default();
            if seen == (status.status.clone(), status.filled) {
                continue;
            }
            let newly_filled = status.filled > seen.1;
            watch.insert(
                status.broker_order_id.clone(),
                (status.status.clone(), status.filled),
            );
            drop_guard_push(&self.shared, BrokerEvent::OrderStatus(status.clone()));
            if newly_filled {
                drop_guard_push(
                    &self.shared,
                    BrokerEvent::OrderFilled(ExecutionFill {
                        execution_id: format!(
                            "poll-{}-{}",
                            status.broker_order_id, status.filled
                        ),
                        broker_order_id: status.broker_order_id.clone(),
                        symbol: String::new(),
                        side: OrderSide::Sell,
                        quantity: status.filled - seen.1,
                        price: status.avg_fill_price.unwrap_or(0.0),
                        time: Utc::now(),
                        commission: None,
                    }),
                );
            }
        }
        Ok(())
    }

    async fn list_open_orders_inner(&self) -> Result<Vec<BrokerOrderStatus>> {
        #[derive(Deserialize)]
        struct LiveOrders {
            #[serde(default)]
            orders: Vec<LiveOrder>,
        }
        #[derive(Deserialize)]
        struct LiveOrder {
            #[serde(rename = "orderId")]
            order_id: serde_json::Value,
            #[serde(default)]
            status: Option<String>,
            #[serde(default, rename = "filledQuantity")]
            filled_quantity: Option<f64>,
            #[serde(default, rename = "remainingQuantity")]
            remaining_quantity: Option<f64>,
            #[serde(default, rename = "avgPrice")]
            avg_price: Option<serde_json::Value>,
        }

        let live: LiveOrders = self
            .get_json(
                "/iserver/account/orders",
                &[],
                Duration::from_secs(self.config.quote_timeout_secs),
            )
            .await?;

        Ok(live
            .orders
            .into_iter()
            .map(|o| BrokerOrderStatus {
                broker_order_id: json_to_string(&o.order_id),
                status: o.status.unwrap_or_default(),
                filled: o.filled_quantity.unwrap_or(0.0) as i64,
                remaining: o.remaining_quantity.unwrap_or(0.0) as i64,
                avg_fill_price: o.avg_price.as_ref().and_then(json_f64),
            })
            .collect())
    }
}

fn drop_guard_push(shared: &Arc<IbkrShared>, event: BrokerEvent) {
    shared.events.lock().push_back(event);
}

fn json_to_string(v: &serde_json::Value) -> String {
    match v {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn json_f64(v: &serde_json::Value) -> Option<f64> {
    match v {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn field_f64(row: &HashMap<String, serde_json::Value>, field: &str) -> Option<f64> {
    row.get(field).and_then(json_f64)
}

fn field_i64(row: &HashMap<String, serde_json::Value>, field: &str) -> Option<i64> {
    field_f64(row, field).map(|f| f as i64)
}

#[async_trait::async_trait]
impl BrokerAdapter for IbkrAdapter {
    async fn account_summary(&self) -> Result<AccountSummary> {
        #[derive(Deserialize)]
        struct Amount {
            #[serde(default)]
            amount: f64,
        }

        let path = format!("/portfolio/{}/summary", self.account_id);
        let raw: HashMap<String, Amount> = self
            .get_json(&path, &[], Duration::from_secs(self.config.whatif_timeout_secs))
            .await?;
        let get = |key: &str| raw.get(key).map(|a| a.amount).unwrap_or(0.0);

        Ok(AccountSummary {
            net_liquidation: get("netliquidation"),
            available_funds: get("availablefunds"),
            excess_liquidity: get("excessliquidity"),
            init_margin: get("initmarginreq"),
            maint_margin: get("maintmarginreq"),
        })
    }

    async fn stock_quote(&self, symbol: &str) -> Result<Quote> {
        let conid = self.underlying_conid(symbol).await?;
        self.quote_for_conid(&conid).await
    }

    async fn option_quote(&self, contract: &OptionContract) -> Result<Quote> {
        let conid = self.resolve_contract(contract).await?;
        self.quote_for_conid(&conid).await
    }

    async fn option_chain(&self, underlying: &str, expiration: NaiveDate) -> Result<Vec<f64>> {
        #[derive(Deserialize)]
        struct Strikes {
            #[serde(default)]
            put: Vec<f64>,
        }

        let conid = self.underlying_conid(underlying).await?;
        let month = expiration.format("%b%y").to_string().to_uppercase();
        let strikes: Strikes = self
            .get_json(
                "/iserver/secdef/strikes",
                &[
                    ("conid", conid),
                    ("sectype", "OPT".to_string()),
                    ("month", month),
                ],
                Duration::from_secs(self.config.chain_timeout_secs),
            )
            .await?;
        Ok(strikes.put)
    }

    async fn greeks_batch(&self, contracts: &[OptionContract]) -> Result<Vec<Option<ChainEntry>>> {
        let mut conids = Vec::with_capacity(contracts.len());
        for contract in contracts {
            match self.resolve_contract(contract).await {
                Ok(conid) => conids.push(Some(conid)),
                Err(e) => {
                    debug!(symbol = %contract.occ_symbol(), "qualify failed: {e:#}");
                    conids.push(None);
                }
            }
        }

        let wanted: Vec<String> = conids.iter().flatten().cloned().collect();
        if wanted.is_empty() {
            return Ok(vec![None; contracts.len()]);
        }
        let rows = self
            .snapshot(
                &wanted,
                &[
                    FIELD_BID,
                    FIELD_ASK,
                    FIELD_VOLUME,
                    FIELD_DELTA,
                    FIELD_GAMMA,
                    FIELD_THETA,
                    FIELD_IV,
                    FIELD_OPEN_INTEREST,
                ],
                Duration::from_secs(self.config.chain_timeout_secs),
            )
            .await?;

        let mut by_conid: HashMap<String, &HashMap<String, serde_json::Value>> = HashMap::new();
        for row in &rows {
            if let Some(conid) = row.get("conid").map(json_to_string) {
                by_conid.insert(conid, row);
            }
        }

        let mut out = Vec::with_capacity(contracts.len());
        for (contract, conid) in contracts.iter().zip(conids.iter()) {
            let entry = conid
                .as_ref()
                .and_then(|c| by_conid.get(c))
                .and_then(|row| {
                    let bid = field_f64(row, FIELD_BID)?;
                    let ask = field_f64(row, FIELD_ASK)?;
                    Some(ChainEntry {
                        contract: OptionContract {
                            conid: Some(json_to_string(row.get("conid")?)),
                            ..contract.clone()
                        },
                        greeks: Greeks {
                            delta: field_f64(row, FIELD_DELTA),
                            gamma: field_f64(row, FIELD_GAMMA),
                            theta: field_f64(row, FIELD_THETA),
                            iv: field_f64(row, FIELD_IV),
                        },
                        bid,
                        ask,
                        volume: field_i64(row, FIELD_VOLUME).unwrap_or(0),
                        open_interest: field_i64(row, FIELD_OPEN_INTEREST).unwrap_or(0),
                    })
                });
            out.push(entry);
        }
        Ok(out)
    }

    async fn qualify_contracts(
        &self,
        contracts: Vec<OptionContract>,
    ) -> Result<Vec<OptionContract>> {
        let mut out = Vec::with_capacity(contracts.len());
        for mut contract in contracts {
            let conid = self.resolve_contract(&contract).await?;
            contract.conid = Some(conid);
            out.push(contract);
        }
        Ok(out)
    }

    async fn whatif_order(
        &self,
        contract: &OptionContract,
        ticket: &OrderTicket,
    ) -> Result<MarginImpact> {
        #[derive(Deserialize)]
        struct WhatIf {
            #[serde(default)]
            amount: HashMap<String, serde_json::Value>,
        }

        let conid = self.resolve_contract(contract).await?;
        let path = format!("/iserver/account/{}/orders/whatif", self.account_id);
        let body = serde_json::json!({
            "orders": [self.order_payload(&conid, ticket, None, None)]
        });
        let result: WhatIf = self
            .post_json(&path, &body, Duration::from_secs(self.config.whatif_timeout_secs))
            .await?;

        let get = |key: &str| {
            result
                .amount
                .get(key)
                .and_then(json_f64)
                .unwrap_or(0.0)
        };
        Ok(MarginImpact {
            init_margin_after: get("initial"),
            maint_margin_after: get("maintenance"),
            equity_after: get("equity"),
            commission_est: get("commission"),
        })
    }

    async fn place_order(
        &self,
        contract: &OptionContract,
        ticket: &OrderTicket,
    ) -> Result<OrderRef> {
        let conid = self.resolve_contract(contract).await?;
        let coid = uuid::Uuid::new_v4().to_string();
        let refs = self
            .submit_orders(vec![self.order_payload(&conid, ticket, Some(&coid), None)])
            .await?;
        refs.into_iter()
            .next()
            .ok_or_else(|| anyhow!("no order ref returned"))
    }

    /// Children ride in the same submission list referencing the parent
    /// cOID; the gateway holds them until the parent is accepted.
    async fn place_bracket(
        &self,
        contract: &OptionContract,
        bracket: &BracketTicket,
    ) -> Result<BracketRefs> {
        let conid = self.resolve_contract(contract).await?;
        let parent_coid = uuid::Uuid::new_v4().to_string();

        let mut orders = vec![self.order_payload(&conid, &bracket.parent, Some(&parent_coid), None)];
        for child in [&bracket.profit_target, &bracket.stop]
            .into_iter()
            .flatten()
        {
            orders.push(self.order_payload(&conid, child, None, Some(&parent_coid)));
        }

        let mut refs = self.submit_orders(orders).await?;
        if refs.is_empty() {
            return Err(anyhow!("bracket submission returned nothing"));
        }
        let parent = refs.remove(0);
        Ok(BracketRefs {
            parent,
            children: refs,
        })
    }

    async fn modify_order(&self, broker_order_id: &str, new_limit: f64) -> Result<OrderRef> {
        #[derive(Deserialize)]
        struct ModifyRow {
            #[serde(default)]
            order_id: Option<String>,
            #[serde(default)]
            order_status: Option<String>,
        }

        let path = format!(
            "/iserver/account/{}/order/{}",
            self.account_id, broker_order_id
        );
        let body = serde_json::json!({ "price": new_limit, "orderType": "LMT" });
        let rows: Vec<ModifyRow> = self
            .post_json(&path, &body, Duration::from_secs(self.config.submit_timeout_secs))
            .await?;
        let row = rows.into_iter().next().unwrap_or(ModifyRow {
            order_id: None,
            order_status: None,
        });
        Ok(OrderRef {
            broker_order_id: row
                .order_id
                .unwrap_or_else(|| broker_order_id.to_string()),
            status: row.order_status.unwrap_or_else(|| "Submitted".to_string()),
        })
    }

    async fn cancel_order(&self, broker_order_id: &str) -> Result<String> {
        let path = format!(
            "/iserver/account/{}/order/{}",
            self.account_id, broker_order_id
        );
        let resp = self
            .http
            .delete(self.url(&path))
            .timeout(Duration::from_secs(self.config.submit_timeout_secs))
            .send()
            .await
            .with_context(|| format!("DELETE {path} failed"))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow!("DELETE {path} {}: {}", status.as_u16(), text));
        }
        Ok("Cancelled".to_string())
    }

    async fn order_status(&self, broker_order_id: &str) -> Result<BrokerOrderStatus> {
        let orders = self.list_open_orders_inner().await?;
        orders
            .into_iter()
            .find(|o| o.broker_order_id == broker_order_id)
            .ok_or_else(|| anyhow!("order {broker_order_id} not in live orders"))
    }

    async fn list_open_orders(&self) -> Result<Vec<BrokerOrderStatus>> {
        self.list_open_orders_inner().await
    }

    async fn list_executions(&self) -> Result<Vec<ExecutionFill>> {
        #[derive(Deserialize)]
        struct TradeRow {
            #[serde(default)]
            execution_id: String,
            #[serde(default)]
            order_ref: Option<String>,
            #[serde(default, rename = "order_id")]
            order_id: Option<serde_json::Value>,
            #[serde(default)]
            symbol: String,
            #[serde(default)]
            side: String,
            #[serde(default)]
            size: f64,
            #[serde(default)]
            price: serde_json::Value,
            #[serde(default)]
            commission: Option<serde_json::Value>,
            #[serde(default, rename = "trade_time_r")]
            trade_time_ms: Option<i64>,
        }

        let rows: Vec<TradeRow> = self
            .get_json(
                "/iserver/account/trades",
                &[],
                Duration::from_secs(self.config.chain_timeout_secs),
            )
            .await?;

        Ok(rows
            .into_iter()
            .map(|r| ExecutionFill {
                execution_id: r.execution_id,
                broker_order_id: r
                    .order_id
                    .as_ref()
                    .map(json_to_string)
                    .or(r.order_ref)
                    .unwrap_or_default(),
                symbol: r.symbol,
                side: OrderSide::parse(&r.side).unwrap_or(OrderSide::Sell),
                quantity: r.size as i64,
                price: json_f64(&r.price).unwrap_or(0.0),
                time: r
                    .trade_time_ms
                    .and_then(|ms| chrono::DateTime::from_timestamp_millis(ms))
                    .unwrap_or_else(Utc::now),
                commission: r.commission.as_ref().and_then(json_f64),
            })
            .collect())
    }

    async fn list_positions(&self) -> Result<Vec<BrokerPosition>> {
        #[derive(Deserialize)]
        struct PositionRow {
            #[serde(default, rename = "contractDesc")]
            contract_desc: String,
            #[serde(default)]
            position: f64,
            #[serde(default, rename = "avgCost")]
            avg_cost: f64,
            #[serde(default, rename = "assetClass")]
            asset_class: String,
            #[serde(default)]
            ticker: Option<String>,
            #[serde(default)]
            strike: Option<serde_json::Value>,
            #[serde(default, rename = "expiry")]
            expiry: Option<String>,
            #[serde(default, rename = "putOrCall")]
            put_or_call: Option<String>,
        }

        let path = format!("/portfolio/{}/positions/0", self.account_id);
        let rows: Vec<PositionRow> = self
            .get_json(&path, &[], Duration::from_secs(self.config.chain_timeout_secs))
            .await?;

        Ok(rows
            .into_iter()
            .filter(|r| r.position != 0.0)
            .map(|r| BrokerPosition {
                symbol: r
                    .ticker
                    .unwrap_or_else(|| r.contract_desc.split(' ').next().unwrap_or("").to_string()),
                sec_type: r.asset_class,
                right: r.put_or_call.as_deref().and_then(OptionRight::parse),
                strike: r.strike.as_ref().and_then(json_f64),
                expiration: r
                    .expiry
                    .as_deref()
                    .and_then(|s| NaiveDate::parse_from_str(s, "%Y%m%d").ok()),
                quantity: r.position as i64,
                avg_cost: r.avg_cost,
            })
            .collect())
    }

    fn is_connected(&self) -> bool {
        *self.shared.connected.lock()
    }

    fn drain_events(&self) -> Vec<BrokerEvent> {
        self.shared.events.lock().drain(..).collect()
    }

    fn invalidate_caches(&self) {
        self.shared.contract_cache.lock().clear();
        self.shared.underlying_cache.lock().clear();
        warn!("broker caches invalidated after disconnect");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_value_coercions() {
        assert_eq!(json_f64(&serde_json::json!(1.5)), Some(1.5));
        assert_eq!(json_f64(&serde_json::json!("2.25")), Some(2.25));
        assert_eq!(json_f64(&serde_json::json!(null)), None);
        assert_eq!(json_to_string(&serde_json::json!("abc")), "abc");
        assert_eq!(json_to_string(&serde_json::json!(42)), "42");
    }

    #[test]
    fn requires_account_id() {
        let config = BrokerConfig::default();
        assert!(IbkrAdapter::new(config).is_err());
    }
}
