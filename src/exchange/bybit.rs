use std::sync::Mutex;

use anyhow::{anyhow, Result};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::exchange::retry::is_retryable_http_error;
use crate::exchange::signing::sign_bybit;
use crate::exchange::{
    Candle, InstrumentFilters, LimitOrder, OrderAck, OrderSide, SetupOutcome, Ticker, Venue,
};
use crate::sizing::format_to_step;
use crate::state::{now_ms, Config, Credentials};

/// Bybit v5 unified-trading REST client.
pub struct BybitClient {
    client: Client,
    base: String,
    category: String,
    recv_window_ms: u64,
    creds: Option<Credentials>,
    filters: Mutex<Option<InstrumentFilters>>,
}

/// A response with a non-zero `retCode`.
#[derive(Debug, Clone)]
pub struct BybitError {
    pub code: i64,
    pub msg: String,
}

impl BybitError {
    /// Setup calls answer with these when the requested state already holds.
    pub fn is_not_modified(&self) -> bool {
        matches!(self.code, 110025 | 110043) || self.msg.to_lowercase().contains("not modified")
    }
}

impl std::fmt::Display for BybitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "bybit error {}: {}", self.code, self.msg)
    }
}

impl std::error::Error for BybitError {}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    ret_code: i64,
    #[serde(default)]
    ret_msg: String,
    #[serde(default)]
    result: Value,
}

#[derive(Deserialize, Debug)]
struct ListResult<T> {
    #[serde(default = "Vec::new")]
    list: Vec<T>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct InstrumentInfo {
    lot_size_filter: LotSizeFilter,
    price_filter: PriceFilter,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct LotSizeFilter {
    qty_step: String,
    min_order_qty: String,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct PriceFilter {
    tick_size: String,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct TickerInfo {
    last_price: String,
    #[serde(default)]
    mark_price: Option<String>,
}

#[derive(Deserialize, Debug)]
struct PositionInfo {
    #[serde(default)]
    size: String,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct CreatedOrder {
    order_id: String,
}

fn parse_num(field: &str, raw: &str) -> Result<f64> {
    raw.trim()
        .parse::<f64>()
        .map_err(|e| anyhow!("bad {} {:?}: {}", field, raw, e))
}

/// Kline rows are `[start, open, high, low, close, volume, turnover]`,
/// newest first. Returns them ascending.
fn parse_klines(rows: &[Vec<String>]) -> Result<Vec<Candle>> {
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        if row.len() < 5 {
            return Err(anyhow!("short kline row: {:?}", row));
        }
        out.push(Candle {
            ts: row[0].parse().map_err(|e| anyhow!("bad kline start {:?}: {}", row[0], e))?,
            o: parse_num("open", &row[1])?,
            h: parse_num("high", &row[2])?,
            l: parse_num("low", &row[3])?,
            c: parse_num("close", &row[4])?,
            v: row.get(5).map(|v| parse_num("volume", v)).transpose()?.unwrap_or(0.0),
        });
    }
    out.sort_by_key(|c| c.ts);
    Ok(out)
}

/// Query string in parameter order; the signature covers it verbatim.
fn encode_query(params: &[(&str, String)]) -> String {
    let mut ser = url::form_urlencoded::Serializer::new(String::new());
    for (k, v) in params {
        ser.append_pair(k, v);
    }
    ser.finish()
}

impl BybitClient {
    pub fn new(cfg: &Config, creds: Option<Credentials>) -> Self {
        Self {
            client: Client::new(),
            base: cfg.bybit_base.trim_end_matches('/').to_string(),
            category: cfg.category.clone(),
            recv_window_ms: cfg.recv_window_ms,
            creds,
            filters: Mutex::new(None),
        }
    }

    fn creds(&self) -> Result<&Credentials> {
        self.creds.as_ref().ok_or_else(|| anyhow!("missing API credentials"))
    }

    fn signed_headers(&self, payload: &str) -> Result<Vec<(&'static str, String)>> {
        let creds = self.creds()?;
        let ts = now_ms();
        let sign = sign_bybit(ts, &creds.api_key, self.recv_window_ms, payload, &creds.api_secret)
            .map_err(|e| anyhow!(e))?;
        Ok(vec![
            ("X-BAPI-API-KEY", creds.api_key.clone()),
            ("X-BAPI-TIMESTAMP", ts.to_string()),
            ("X-BAPI-RECV-WINDOW", self.recv_window_ms.to_string()),
            ("X-BAPI-SIGN", sign),
        ])
    }

    async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, String)],
        signed: bool,
    ) -> Result<T> {
        let query = encode_query(params);
        let url = format!("{}{}?{}", self.base, path, query);

        let mut req = self.client.get(&url);
        if signed {
            for (name, value) in self.signed_headers(&query)? {
                req = req.header(name, value);
            }
        }
        let resp = req.send().await?;
        Self::decode(resp).await
    }

    async fn post<T: DeserializeOwned>(&self, path: &str, body: Value) -> Result<T> {
        let payload = body.to_string();
        let url = format!("{}{}", self.base, path);
        let mut req = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .body(payload.clone());
        for (name, value) in self.signed_headers(&payload)? {
            req = req.header(name, value);
        }
        let resp = req.send().await?;
        Self::decode(resp).await
    }

    async fn decode<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T> {
        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            let kind = if is_retryable_http_error(status.as_u16()) { "transient" } else { "rejected" };
            return Err(anyhow!("bybit http {} ({}): {}", status.as_u16(), kind, body));
        }
        let env: Envelope = serde_json::from_str(&body)?;
        if env.ret_code != 0 {
            return Err(BybitError { code: env.ret_code, msg: env.ret_msg }.into());
        }
        Ok(serde_json::from_value(env.result)?)
    }

    fn cached_filters(&self) -> Option<InstrumentFilters> {
        self.filters.lock().ok().and_then(|f| *f)
    }

    fn fmt_qty(&self, qty: f64) -> String {
        match self.cached_filters() {
            Some(f) => format_to_step(qty, f.qty_step),
            None => format_to_step(qty, 1e-8),
        }
    }

    fn fmt_price(&self, price: f64) -> String {
        match self.cached_filters() {
            Some(f) => format_to_step(price, f.price_tick),
            None => format_to_step(price, 1e-8),
        }
    }

    fn setup_result(res: Result<Value>) -> Result<SetupOutcome> {
        match res {
            Ok(_) => Ok(SetupOutcome::Applied),
            Err(e) => match e.downcast_ref::<BybitError>() {
                Some(b) if b.is_not_modified() => Ok(SetupOutcome::Unchanged),
                _ => Err(e),
            },
        }
    }
}

#[async_trait::async_trait]
impl Venue for BybitClient {
    async fn instrument_filters(&self, symbol: &str) -> Result<InstrumentFilters> {
        let res: ListResult<InstrumentInfo> = self
            .get(
                "/v5/market/instruments-info",
                &[("category", self.category.clone()), ("symbol", symbol.to_string())],
                false,
            )
            .await?;
        let info = res
            .list
            .first()
            .ok_or_else(|| anyhow!("no instrument info for {}", symbol))?;
        let filters = InstrumentFilters {
            qty_step: parse_num("qtyStep", &info.lot_size_filter.qty_step)?,
            min_qty: parse_num("minOrderQty", &info.lot_size_filter.min_order_qty)?,
            price_tick: parse_num("tickSize", &info.price_filter.tick_size)?,
        };
        if let Ok(mut slot) = self.filters.lock() {
            *slot = Some(filters);
        }
        Ok(filters)
    }

    async fn set_position_mode(&self, symbol: &str, one_way: bool) -> Result<SetupOutcome> {
        let mode = if one_way { 0 } else { 3 };
        let res = self
            .post(
                "/v5/position/switch-mode",
                json!({ "category": self.category, "symbol": symbol, "mode": mode }),
            )
            .await;
        Self::setup_result(res)
    }

    async fn set_leverage(&self, symbol: &str, leverage: f64) -> Result<SetupOutcome> {
        let lev = leverage.to_string();
        let res = self
            .post(
                "/v5/position/set-leverage",
                json!({
                    "category": self.category,
                    "symbol": symbol,
                    "buyLeverage": lev,
                    "sellLeverage": lev,
                }),
            )
            .await;
        Self::setup_result(res)
    }

    async fn ticker(&self, symbol: &str) -> Result<Ticker> {
        let res: ListResult<TickerInfo> = self
            .get(
                "/v5/market/tickers",
                &[("category", self.category.clone()), ("symbol", symbol.to_string())],
                false,
            )
            .await?;
        let item = res.list.first().ok_or_else(|| anyhow!("empty ticker for {}", symbol))?;
        let last = parse_num("lastPrice", &item.last_price)?;
        let mark = match item.mark_price.as_deref() {
            Some(m) if !m.is_empty() => parse_num("markPrice", m)?,
            _ => last,
        };
        Ok(Ticker { last, mark })
    }

    async fn candles(&self, symbol: &str, interval_min: u64, limit: usize) -> Result<Vec<Candle>> {
        let res: ListResult<Vec<String>> = self
            .get(
                "/v5/market/kline",
                &[
                    ("category", self.category.clone()),
                    ("symbol", symbol.to_string()),
                    ("interval", interval_min.to_string()),
                    ("limit", limit.to_string()),
                ],
                false,
            )
            .await?;
        parse_klines(&res.list)
    }

    async fn place_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        qty: f64,
        reduce_only: bool,
        link_id: &str,
    ) -> Result<OrderAck> {
        let order: CreatedOrder = self
            .post(
                "/v5/order/create",
                json!({
                    "category": self.category,
                    "symbol": symbol,
                    "side": side.as_str(),
                    "orderType": "Market",
                    "qty": self.fmt_qty(qty),
                    "reduceOnly": reduce_only,
                    "orderLinkId": link_id,
                }),
            )
            .await?;
        Ok(OrderAck { order_id: order.order_id })
    }

    async fn place_limit_order(&self, symbol: &str, order: LimitOrder<'_>) -> Result<OrderAck> {
        let tif = if order.post_only { "PostOnly" } else { "GTC" };
        let created: CreatedOrder = self
            .post(
                "/v5/order/create",
                json!({
                    "category": self.category,
                    "symbol": symbol,
                    "side": order.side.as_str(),
                    "orderType": "Limit",
                    "qty": self.fmt_qty(order.qty),
                    "price": self.fmt_price(order.price),
                    "reduceOnly": order.reduce_only,
                    "timeInForce": tif,
                    "closeOnTrigger": false,
                    "orderLinkId": order.link_id,
                }),
            )
            .await?;
        Ok(OrderAck { order_id: created.order_id })
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<()> {
        let _: Value = self
            .post(
                "/v5/order/cancel",
                json!({ "category": self.category, "symbol": symbol, "orderId": order_id }),
            )
            .await?;
        Ok(())
    }

    async fn open_position_size(&self, symbol: &str) -> Result<f64> {
        let res: ListResult<PositionInfo> = self
            .get(
                "/v5/position/list",
                &[("category", self.category.clone()), ("symbol", symbol.to_string())],
                true,
            )
            .await?;
        // one-way mode reports a single row; take the first non-zero size
        for p in &res.list {
            let size = if p.size.trim().is_empty() { 0.0 } else { parse_num("size", &p.size)? };
            if size > 0.0 {
                return Ok(size);
            }
        }
        Ok(0.0)
    }
}
