//! KIS (Korea Investment & Securities) Open API adapter.
//!
//! Every call acquires a rate-limit permit, authenticates through the
//! credential cache, and maps broker responses into the crate taxonomy.
//! An auth-rejection response invalidates the cached token and retries
//! the call exactly once with a fresh one.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Local, NaiveDate, NaiveDateTime, Utc};
use dashmap::DashMap;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method, StatusCode};
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::auth::{AccessToken, CredentialCache, TokenIssuer};
use crate::broker::{BrokerClient, BrokerKind};
use crate::config::BrokerConfig;
use crate::domain::{
    AccountBalance, BalanceLine, Candle, Order, OrderAck, OrderFillReport, OrderIntent, OrderSide,
    OrderType, Quote,
};
use crate::error::{GambitError, Result};
use crate::throttle::RateLimiter;

const DEFAULT_KIS_API_BASE: &str = "https://openapi.koreainvestment.com:9443";
const DEFAULT_KIS_VIRTUAL_API_BASE: &str = "https://openapivts.koreainvestment.com:29443";

/// Operations with distinct transaction ids. Trading operations carry a
/// virtual-account variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TrOp {
    Balance,
    CashBuy,
    CashSell,
    Cancel,
    DailyFills,
    Price,
    DailyCandles,
}

impl TrOp {
    fn tr_id(&self, virtual_account: bool) -> &'static str {
        match (self, virtual_account) {
            (TrOp::Balance, false) => "TTTC8434R",
            (TrOp::Balance, true) => "VTTC8434R",
            (TrOp::CashBuy, false) => "TTTC0802U",
            (TrOp::CashBuy, true) => "VTTC0802U",
            (TrOp::CashSell, false) => "TTTC0801U",
            (TrOp::CashSell, true) => "VTTC0801U",
            (TrOp::Cancel, false) => "TTTC0803U",
            (TrOp::Cancel, true) => "VTTC0803U",
            (TrOp::DailyFills, false) => "TTTC8001R",
            (TrOp::DailyFills, true) => "VTTC8001R",
            // Quotation endpoints share one id across environments.
            (TrOp::Price, _) => "FHKST01010100",
            (TrOp::DailyCandles, _) => "FHKST01010400",
        }
    }

    fn is_order(&self) -> bool {
        matches!(self, TrOp::CashBuy | TrOp::CashSell | TrOp::Cancel)
    }
}

pub struct KisClient {
    http: Client,
    broker_id: String,
    base_url: String,
    app_key: String,
    app_secret: String,
    /// Account number split the way the wire wants it: 8-digit CANO plus
    /// 2-digit product code.
    cano: String,
    acnt_prdt_cd: String,
    account_id: String,
    virtual_account: bool,
    cache: Arc<CredentialCache>,
    limiter: Arc<RateLimiter>,
    /// Acks already returned for an idempotency key. The venue has no
    /// client-order-id field, so replay protection lives on this side of
    /// the wire.
    acked: DashMap<String, OrderAck>,
}

impl KisClient {
    pub fn new(
        broker_id: &str,
        config: &BrokerConfig,
        cache: Arc<CredentialCache>,
        limiter: Arc<RateLimiter>,
    ) -> Result<Self> {
        let (cano, acnt_prdt_cd) = split_account(&config.account_id)?;

        let default_base = if config.virtual_account {
            DEFAULT_KIS_VIRTUAL_API_BASE
        } else {
            DEFAULT_KIS_API_BASE
        };
        let base_url = config
            .base_url
            .as_deref()
            .unwrap_or(default_base)
            .trim_end_matches('/')
            .to_string();

        let http = Client::builder()
            .user_agent("gambit-kis-adapter/0.1")
            .build()
            .map_err(|e| GambitError::Internal(format!("failed to build KIS HTTP client: {}", e)))?;

        Ok(Self {
            http,
            broker_id: broker_id.to_string(),
            base_url,
            app_key: config.app_key.clone(),
            app_secret: config.app_secret.clone(),
            cano,
            acnt_prdt_cd,
            account_id: config.account_id.clone(),
            virtual_account: config.virtual_account,
            cache,
            limiter,
            acked: DashMap::new(),
        })
    }

    /// Issuance path handed to the credential cache. Issuance is an
    /// outbound call like any other and consumes a rate-limit permit.
    pub fn token_issuer(&self) -> Arc<dyn TokenIssuer> {
        Arc::new(KisTokenIssuer {
            http: self.http.clone(),
            base_url: self.base_url.clone(),
            app_key: self.app_key.clone(),
            app_secret: self.app_secret.clone(),
            limiter: self.limiter.clone(),
        })
    }

    fn auth_headers(&self, token: &str, tr_id: &str, hashkey: Option<&str>) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        let mut put = |name: &'static str, value: &str| -> Result<()> {
            headers.insert(
                HeaderName::from_static(name),
                HeaderValue::from_str(value)
                    .map_err(|e| GambitError::Internal(format!("invalid {} header: {}", name, e)))?,
            );
            Ok(())
        };
        put("authorization", &format!("Bearer {}", token))?;
        put("appkey", &self.app_key)?;
        put("appsecret", &self.app_secret)?;
        put("tr_id", tr_id)?;
        put("custtype", "P")?;
        if let Some(hash) = hashkey {
            put("hashkey", hash)?;
        }
        Ok(headers)
    }

    /// Order bodies are signed server-side: the hashkey endpoint returns a
    /// digest that rides along as a header on the actual order call.
    async fn fetch_hashkey(&self, body: &Value) -> Result<String> {
        let _permit = self.limiter.acquire().await?;
        let resp = self
            .http
            .post(format!("{}/uapi/hashkey", self.base_url))
            .header("appkey", &self.app_key)
            .header("appsecret", &self.app_secret)
            .json(body)
            .send()
            .await?;

        let status = resp.status();
        let text = resp.text().await?;
        map_http_status(status, &text, "hashkey", false)?;

        let payload: Value = serde_json::from_str(&text)?;
        payload
            .get("HASH")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| GambitError::Internal("hashkey response missing HASH".to_string()))
    }

    /// One authenticated request with the taxonomy mapping applied, plus
    /// the invalidate-and-retry-once rule for auth rejections.
    async fn authed_request(
        &self,
        method: Method,
        path: &str,
        op: TrOp,
        query: Option<&[(&str, String)]>,
        body: Option<&Value>,
    ) -> Result<Value> {
        let token = self.cache.get_token(&self.broker_id, &self.account_id).await?;
        match self.send_once(&method, path, op, query, body, &token).await {
            Err(err) if err.is_auth() => {
                warn!(
                    broker_id = %self.broker_id,
                    %path,
                    "auth rejection, refreshing token and retrying once"
                );
                self.cache.invalidate(&self.broker_id, &self.account_id).await;
                let token = self.cache.get_token(&self.broker_id, &self.account_id).await?;
                self.send_once(&method, path, op, query, body, &token).await
            }
            other => other,
        }
    }

    async fn send_once(
        &self,
        method: &Method,
        path: &str,
        op: TrOp,
        query: Option<&[(&str, String)]>,
        body: Option<&Value>,
        token: &str,
    ) -> Result<Value> {
        let _permit = self.limiter.acquire().await?;

        let hashkey = match body {
            Some(body) if op.is_order() => Some(self.fetch_hashkey(body).await?),
            _ => None,
        };

        let url = format!("{}{}", self.base_url, path);
        let tr_id = op.tr_id(self.virtual_account);
        let mut req = self
            .http
            .request(method.clone(), &url)
            .headers(self.auth_headers(token, tr_id, hashkey.as_deref())?);

        if let Some(query) = query {
            req = req.query(query);
        }
        if let Some(body) = body {
            req = req.json(body);
        }

        let resp = req.send().await?;
        let status = resp.status();
        let text = resp.text().await?;
        map_http_status(status, &text, path, op.is_order())?;

        let payload: Value = serde_json::from_str(&text)
            .map_err(|e| GambitError::Internal(format!("invalid KIS JSON response: {}", e)))?;
        check_rt_cd(&payload, path, op.is_order())?;
        Ok(payload)
    }

    fn balance_query(&self) -> Vec<(&'static str, String)> {
        vec![
            ("CANO", self.cano.clone()),
            ("ACNT_PRDT_CD", self.acnt_prdt_cd.clone()),
            ("AFHR_FLPR_YN", "N".to_string()),
            ("OFL_YN", "N".to_string()),
            ("INQR_DVSN", "01".to_string()),
            ("UNPR_DVSN", "01".to_string()),
            ("FUND_STTL_ICLD_YN", "N".to_string()),
            ("FNCG_AMT_AUTO_RDPT_YN", "N".to_string()),
            ("PRCS_DVSN", "01".to_string()),
            ("CTX_AREA_FK100", String::new()),
            ("CTX_AREA_NK100", String::new()),
        ]
    }

    fn order_body(&self, intent: &OrderIntent) -> Value {
        let (ord_dvsn, ord_unpr) = match (intent.order_type, intent.limit_price) {
            (OrderType::Limit, Some(price)) => ("00", price.normalize().to_string()),
            // Market orders carry a zero price on this venue.
            _ => ("01", "0".to_string()),
        };
        json!({
            "CANO": self.cano,
            "ACNT_PRDT_CD": self.acnt_prdt_cd,
            "PDNO": intent.instrument_code,
            "ORD_DVSN": ord_dvsn,
            "ORD_QTY": intent.quantity.trunc().to_string(),
            "ORD_UNPR": ord_unpr,
        })
    }
}

#[async_trait]
impl BrokerClient for KisClient {
    fn kind(&self) -> BrokerKind {
        BrokerKind::Kis
    }

    fn broker_id(&self) -> &str {
        &self.broker_id
    }

    fn account_id(&self) -> &str {
        &self.account_id
    }

    async fn authenticate(&self) -> Result<()> {
        self.cache
            .get_token(&self.broker_id, &self.account_id)
            .await
            .map(|_| ())
    }

    async fn fetch_balance(&self) -> Result<AccountBalance> {
        let query = self.balance_query();
        let payload = self
            .authed_request(
                Method::GET,
                "/uapi/domestic-stock/v1/trading/inquire-balance",
                TrOp::Balance,
                Some(&query),
                None,
            )
            .await?;
        parse_balance(&payload, &self.account_id)
    }

    async fn fetch_quote(&self, instrument_code: &str) -> Result<Quote> {
        let query = vec![
            ("FID_COND_MRKT_DIV_CODE", "J".to_string()),
            ("FID_INPUT_ISCD", instrument_code.to_string()),
        ];
        let payload = self
            .authed_request(
                Method::GET,
                "/uapi/domestic-stock/v1/quotations/inquire-price",
                TrOp::Price,
                Some(&query),
                None,
            )
            .await?;
        parse_quote(&payload, instrument_code)
    }

    async fn fetch_candles(&self, instrument_code: &str, count: usize) -> Result<Vec<Candle>> {
        // Calendar span padded for weekends and holidays.
        let span_days = (count as i64 * 2).max(14);
        let to = Local::now().date_naive();
        let from = to - ChronoDuration::days(span_days);

        let query = vec![
            ("FID_COND_MRKT_DIV_CODE", "J".to_string()),
            ("FID_INPUT_ISCD", instrument_code.to_string()),
            ("FID_PERIOD_DIV_CODE", "D".to_string()),
            ("FID_ORG_ADJ_PRC", "1".to_string()),
            ("FID_FROM_DT", from.format("%Y%m%d").to_string()),
            ("FID_TO_DT", to.format("%Y%m%d").to_string()),
        ];
        let payload = self
            .authed_request(
                Method::GET,
                "/uapi/domestic-stock/v1/quotations/inquire-daily-price",
                TrOp::DailyCandles,
                Some(&query),
                None,
            )
            .await?;

        let mut candles = parse_candles(&payload)?;
        if candles.len() > count {
            candles.drain(..candles.len() - count);
        }
        Ok(candles)
    }

    async fn place_order(&self, intent: &OrderIntent) -> Result<OrderAck> {
        let key = intent.idempotency_key();
        if let Some(ack) = self.acked.get(&key) {
            debug!(
                broker_id = %self.broker_id,
                idempotency_key = %key,
                broker_order_id = %ack.broker_order_id,
                "replaying acknowledgment for already-accepted order"
            );
            return Ok(ack.clone());
        }

        let op = match intent.side {
            OrderSide::Buy => TrOp::CashBuy,
            OrderSide::Sell => TrOp::CashSell,
        };
        let body = self.order_body(intent);
        let payload = self
            .authed_request(
                Method::POST,
                "/uapi/domestic-stock/v1/trading/order-cash",
                op,
                None,
                Some(&body),
            )
            .await?;

        let ack = parse_order_ack(&payload)?;
        self.acked.insert(key, ack.clone());
        Ok(ack)
    }

    async fn fetch_order_status(&self, broker_order_id: &str) -> Result<OrderFillReport> {
        let today = Local::now().format("%Y%m%d").to_string();
        let query = vec![
            ("CANO", self.cano.clone()),
            ("ACNT_PRDT_CD", self.acnt_prdt_cd.clone()),
            ("INQR_STRT_DT", today.clone()),
            ("INQR_END_DT", today),
            ("SLL_BUY_DVSN_CD", "00".to_string()),
            ("INQR_DVSN", "00".to_string()),
            ("PDNO", String::new()),
            ("CCLD_DVSN", "00".to_string()),
            ("ORD_GNO_BRNO", String::new()),
            ("ODNO", broker_order_id.to_string()),
            ("INQR_DVSN_3", "00".to_string()),
            ("INQR_DVSN_1", String::new()),
            ("CTX_AREA_FK100", String::new()),
            ("CTX_AREA_NK100", String::new()),
        ];
        let payload = self
            .authed_request(
                Method::GET,
                "/uapi/domestic-stock/v1/trading/inquire-daily-ccld",
                TrOp::DailyFills,
                Some(&query),
                None,
            )
            .await?;
        parse_fill_report(&payload, broker_order_id)
    }

    async fn cancel_order(&self, order: &Order) -> Result<bool> {
        let broker_order_id = order.broker_order_id.as_deref().ok_or_else(|| {
            GambitError::Validation("cannot cancel an order without a broker order id".to_string())
        })?;

        let ord_dvsn = match order.order_type {
            OrderType::Limit => "00",
            OrderType::Market => "01",
        };
        let body = json!({
            "CANO": self.cano,
            "ACNT_PRDT_CD": self.acnt_prdt_cd,
            "KRX_FWDG_ORD_ORGNO": order.forwarding_org_no.clone().unwrap_or_default(),
            "ORGN_ODNO": broker_order_id,
            "ORD_DVSN": ord_dvsn,
            "RVSE_CNCL_DVSN_CD": "02",
            "ORD_QTY": "0",
            "ORD_UNPR": "0",
            "QTY_ALL_ORD_YN": "Y",
        });

        match self
            .authed_request(
                Method::POST,
                "/uapi/domestic-stock/v1/trading/order-rvsecncl",
                TrOp::Cancel,
                None,
                Some(&body),
            )
            .await
        {
            Ok(_) => Ok(true),
            Err(GambitError::RejectedOrder(reason)) => {
                warn!(
                    broker_id = %self.broker_id,
                    %broker_order_id,
                    %reason,
                    "broker no longer considers order cancellable"
                );
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }
}

struct KisTokenIssuer {
    http: Client,
    base_url: String,
    app_key: String,
    app_secret: String,
    limiter: Arc<RateLimiter>,
}

#[async_trait]
impl TokenIssuer for KisTokenIssuer {
    async fn issue_token(&self) -> Result<AccessToken> {
        let _permit = self.limiter.acquire().await?;

        let body = json!({
            "grant_type": "client_credentials",
            "appkey": self.app_key,
            "appsecret": self.app_secret,
        });
        let resp = self
            .http
            .post(format!("{}/oauth2/tokenP", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| GambitError::Auth(format!("token request failed: {}", e)))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| GambitError::Auth(format!("token response unreadable: {}", e)))?;
        if !status.is_success() {
            return Err(GambitError::Auth(format!(
                "token issuance failed: status={} body={}",
                status, text
            )));
        }

        let payload: Value = serde_json::from_str(&text)
            .map_err(|e| GambitError::Auth(format!("invalid token response: {}", e)))?;
        let access_token = payload
            .get("access_token")
            .and_then(Value::as_str)
            .ok_or_else(|| GambitError::Auth("token response missing access_token".to_string()))?;

        Ok(AccessToken::new(
            access_token.to_string(),
            parse_token_expiry(&payload),
        ))
    }
}

/// Expiry comes as either a local-time wall clock string or a seconds
/// count; a missing field falls back to one day.
fn parse_token_expiry(payload: &Value) -> DateTime<Utc> {
    if let Some(expires_str) = payload
        .get("access_token_token_expired")
        .and_then(Value::as_str)
    {
        if let Ok(naive) = NaiveDateTime::parse_from_str(expires_str, "%Y-%m-%d %H:%M:%S") {
            let remaining = naive - Local::now().naive_local();
            return Utc::now() + remaining;
        }
    }
    if let Some(expires_in) = payload.get("expires_in").and_then(Value::as_i64) {
        return Utc::now() + ChronoDuration::seconds(expires_in);
    }
    Utc::now() + ChronoDuration::days(1)
}

fn split_account(account_id: &str) -> Result<(String, String)> {
    let digits: String = account_id.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() != 10 {
        return Err(GambitError::Validation(format!(
            "account id '{}' must contain 10 digits",
            account_id
        )));
    }
    Ok((digits[..8].to_string(), digits[8..].to_string()))
}

fn map_http_status(status: StatusCode, body: &str, context: &str, is_order: bool) -> Result<()> {
    if status.is_success() {
        return Ok(());
    }
    let detail = format!("{} failed: status={} body={}", context, status, body);
    match status.as_u16() {
        401 | 403 => Err(GambitError::Auth(detail)),
        429 => Err(GambitError::TransientBroker(detail)),
        code if code >= 500 => Err(GambitError::TransientBroker(detail)),
        _ if is_order => Err(GambitError::RejectedOrder(detail)),
        _ => Err(GambitError::DataUnavailable(detail)),
    }
}

/// The venue signals business-level failure in-band with `rt_cd`.
fn check_rt_cd(payload: &Value, context: &str, is_order: bool) -> Result<()> {
    let rt_cd = payload.get("rt_cd").and_then(Value::as_str).unwrap_or("0");
    if rt_cd == "0" {
        return Ok(());
    }
    let msg = payload
        .get("msg1")
        .and_then(Value::as_str)
        .unwrap_or("unknown broker error");
    let detail = format!("{}: rt_cd={} {}", context, rt_cd, msg.trim());
    if is_order {
        Err(GambitError::RejectedOrder(detail))
    } else {
        Err(GambitError::DataUnavailable(detail))
    }
}

fn decimal_field(row: &Value, key: &str) -> Decimal {
    row.get(key)
        .and_then(Value::as_str)
        .and_then(|s| Decimal::from_str_exact(s.trim()).ok())
        .unwrap_or(Decimal::ZERO)
}

fn str_field<'a>(row: &'a Value, key: &str) -> &'a str {
    row.get(key).and_then(Value::as_str).unwrap_or("")
}

fn parse_balance(payload: &Value, account_id: &str) -> Result<AccountBalance> {
    let holdings = payload
        .get("output1")
        .and_then(Value::as_array)
        .map(|rows| {
            rows.iter()
                .map(|row| BalanceLine {
                    instrument_code: str_field(row, "pdno").to_string(),
                    name: str_field(row, "prdt_name").to_string(),
                    quantity: decimal_field(row, "hldg_qty"),
                    average_price: decimal_field(row, "pchs_avg_pric"),
                    current_price: decimal_field(row, "prpr"),
                    pnl_pct: decimal_field(row, "evlu_pfls_rt"),
                    sellable_quantity: decimal_field(row, "ord_psbl_qty"),
                })
                .collect()
        })
        .unwrap_or_default();

    let cash = payload
        .get("output2")
        .and_then(Value::as_array)
        .and_then(|rows| rows.first())
        .map(|row| decimal_field(row, "dnca_tot_amt"))
        .unwrap_or(Decimal::ZERO);

    Ok(AccountBalance {
        account_id: account_id.to_string(),
        cash,
        holdings,
        as_of: Utc::now(),
    })
}

fn parse_quote(payload: &Value, instrument_code: &str) -> Result<Quote> {
    let output = payload
        .get("output")
        .ok_or_else(|| GambitError::DataUnavailable(format!("no quote for {}", instrument_code)))?;
    let price = decimal_field(output, "stck_prpr");
    if price.is_zero() {
        return Err(GambitError::DataUnavailable(format!(
            "zero quote for {}",
            instrument_code
        )));
    }
    Ok(Quote::new(instrument_code, price))
}

fn parse_candles(payload: &Value) -> Result<Vec<Candle>> {
    let rows = payload
        .get("output")
        .and_then(Value::as_array)
        .ok_or_else(|| GambitError::DataUnavailable("daily price output missing".to_string()))?;

    // Rows arrive most-recent first.
    let mut candles = Vec::with_capacity(rows.len());
    for row in rows.iter().rev() {
        let date_str = str_field(row, "stck_bsop_date");
        let date = NaiveDate::parse_from_str(date_str, "%Y%m%d").map_err(|_| {
            GambitError::DataUnavailable(format!("unparseable candle date '{}'", date_str))
        })?;
        candles.push(Candle {
            date,
            open: decimal_field(row, "stck_oprc"),
            high: decimal_field(row, "stck_hgpr"),
            low: decimal_field(row, "stck_lwpr"),
            close: decimal_field(row, "stck_clpr"),
            volume: row
                .get("acml_vol")
                .and_then(Value::as_str)
                .and_then(|s| s.trim().parse().ok())
                .unwrap_or(0),
        });
    }
    Ok(candles)
}

fn parse_order_ack(payload: &Value) -> Result<OrderAck> {
    let output = payload
        .get("output")
        .ok_or_else(|| GambitError::RejectedOrder("order response missing output".to_string()))?;
    let broker_order_id = str_field(output, "ODNO");
    if broker_order_id.is_empty() {
        return Err(GambitError::RejectedOrder(
            "order response missing ODNO".to_string(),
        ));
    }
    let forwarding_org_no = match str_field(output, "KRX_FWDG_ORD_ORGNO") {
        "" => None,
        org => Some(org.to_string()),
    };
    Ok(OrderAck {
        broker_order_id: broker_order_id.to_string(),
        forwarding_org_no,
        accepted_at: Utc::now(),
    })
}

fn parse_fill_report(payload: &Value, broker_order_id: &str) -> Result<OrderFillReport> {
    let rows = payload
        .get("output1")
        .and_then(Value::as_array)
        .ok_or_else(|| {
            GambitError::DataUnavailable("order inquiry output missing".to_string())
        })?;

    for row in rows {
        if str_field(row, "odno").trim_start_matches('0')
            == broker_order_id.trim_start_matches('0')
        {
            let requested = decimal_field(row, "ord_qty");
            let filled = decimal_field(row, "tot_ccld_qty");
            let remaining = decimal_field(row, "rmn_qty");
            let average = decimal_field(row, "avg_prvs");
            return Ok(OrderFillReport {
                broker_order_id: broker_order_id.to_string(),
                requested_quantity: requested,
                filled_quantity: filled,
                remaining_quantity: remaining,
                average_price: if average.is_zero() { None } else { Some(average) },
            });
        }
    }
    Err(GambitError::DataUnavailable(format!(
        "order {} not in today's fill inquiry",
        broker_order_id
    )))
}
