//! Wire clients for the external feeds each worker pulls from.
//!
//! Grounded on the teacher's `scrapers/` clients (`dome_rest.rs` in
//! particular): a thin `reqwest::Client` wrapper per vendor, a typed
//! response shape, and a translation step into this crate's own raw item
//! structs so pipeline code never sees vendor wire formats directly.

use crate::chart::PriceHistorySource;
use crate::error::{Error, Result};
use crate::pipelines::disclosure::{DisclosureSource, RawDisclosure};
use crate::pipelines::news::{NewsSource, RawNewsItem};
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Deserialize;
use std::time::Duration;

/// Korea's public disclosure system (DART, Data Analysis, Retrieval and
/// Transfer System). `https://opendart.fss.or.kr` is the real public
/// endpoint; requires a free API key.
pub struct DartDisclosureSource {
    client: reqwest::Client,
    api_key: String,
}

impl DartDisclosureSource {
    pub fn new(api_key: String) -> Self {
        Self { client: reqwest::Client::builder().timeout(Duration::from_secs(15)).build().unwrap_or_default(), api_key }
    }
}

#[derive(Debug, Deserialize)]
struct DartListResponse {
    status: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    list: Vec<DartFiling>,
}

#[derive(Debug, Deserialize)]
struct DartFiling {
    rcept_no: String,
    corp_code: String,
    report_nm: String,
    flr_nm: String,
    rcept_dt: String,
}

#[async_trait]
impl DisclosureSource for DartDisclosureSource {
    async fn fetch_latest(&self, stock_code: &str) -> Result<Vec<RawDisclosure>> {
        let resp: DartListResponse = self
            .client
            .get("https://opendart.fss.or.kr/api/list.json")
            .query(&[
                ("crtfc_key", self.api_key.as_str()),
                ("corp_code", stock_code),
                ("page_count", "20"),
            ])
            .send()
            .await?
            .json()
            .await?;

        if resp.status == "013" {
            // DART's "no matching data" code — not an error, just nothing new.
            return Ok(Vec::new());
        }
        if resp.status != "000" {
            return Err(Error::Provider { provider: "dart".into(), message: resp.message.unwrap_or(resp.status) });
        }

        Ok(resp
            .list
            .into_iter()
            .filter_map(|f| {
                Some(RawDisclosure {
                    rcept_no: f.rcept_no,
                    corp_code: f.corp_code,
                    report_name: f.report_nm,
                    filer: f.flr_nm,
                    receipt_date: NaiveDate::parse_from_str(&f.rcept_dt, "%Y%m%d").ok()?,
                    raw_note: None,
                })
            })
            .collect())
    }
}

/// Korea Investment & Securities' OpenAPI. Used both as the realtime price
/// feed a chart worker ticks on and, via `forward_prices`, as the historical
/// lookup the chart engine uses to compute a past-case's realized return.
pub struct KisPriceHistorySource {
    client: reqwest::Client,
    app_key: String,
    app_secret: String,
}

impl KisPriceHistorySource {
    pub fn new(app_key: String, app_secret: String) -> Self {
        Self { client: reqwest::Client::builder().timeout(Duration::from_secs(10)).build().unwrap_or_default(), app_key, app_secret }
    }
}

#[derive(Debug, Deserialize)]
struct KisDailyPriceResponse {
    #[serde(default)]
    output: Vec<KisDailyPriceRow>,
}

#[derive(Debug, Deserialize)]
struct KisDailyPriceRow {
    stck_bsop_date: String,
    stck_clpr: String,
}

#[derive(Debug, Deserialize)]
struct KisQuoteResponse {
    output: KisQuoteRow,
}

#[derive(Debug, Deserialize)]
struct KisQuoteRow {
    stck_prpr: String,
    acml_vol: String,
}

impl KisPriceHistorySource {
    /// Current traded price and cumulative volume for `stock_code`, the
    /// live tick a chart worker feeds into `ChartEngine::on_tick`.
    pub async fn fetch_quote(&self, stock_code: &str) -> Result<(f64, f64)> {
        let resp: KisQuoteResponse = self
            .client
            .get("https://openapi.koreainvestment.com:9443/uapi/domestic-stock/v1/quotations/inquire-price")
            .header("appkey", &self.app_key)
            .header("appsecret", &self.app_secret)
            .query(&[("FID_COND_MRKT_DIV_CODE", "J"), ("FID_INPUT_ISCD", stock_code)])
            .send()
            .await?
            .json()
            .await?;

        let price = resp.output.stck_prpr.parse().map_err(|_| Error::Provider {
            provider: "kis".into(),
            message: "unparseable quote price".into(),
        })?;
        let volume = resp.output.acml_vol.parse().unwrap_or(0.0);
        Ok((price, volume))
    }
}

#[async_trait]
impl PriceHistorySource for KisPriceHistorySource {
    async fn forward_prices(&self, stock_code: &str, from_date: NaiveDate, n: u32) -> Result<Vec<f64>> {
        let to_date = from_date + chrono::Duration::days((n as i64) * 3);
        let resp: KisDailyPriceResponse = self
            .client
            .get("https://openapi.koreainvestment.com:9443/uapi/domestic-stock/v1/quotations/inquire-daily-itemchartprice")
            .header("appkey", &self.app_key)
            .header("appsecret", &self.app_secret)
            .query(&[
                ("FID_COND_MRKT_DIV_CODE", "J"),
                ("FID_INPUT_ISCD", stock_code),
                ("FID_INPUT_DATE_1", &from_date.format("%Y%m%d").to_string()),
                ("FID_INPUT_DATE_2", &to_date.format("%Y%m%d").to_string()),
                ("FID_PERIOD_DIV_CODE", "D"),
            ])
            .send()
            .await?
            .json()
            .await?;

        let mut rows: Vec<(NaiveDate, f64)> = resp
            .output
            .into_iter()
            .filter_map(|r| {
                let date = NaiveDate::parse_from_str(&r.stck_bsop_date, "%Y%m%d").ok()?;
                let close = r.stck_clpr.parse().ok()?;
                Some((date, close))
            })
            .filter(|(d, _)| *d > from_date)
            .collect();
        rows.sort_by_key(|(d, _)| *d);
        rows.truncate(n as usize);
        Ok(rows.into_iter().map(|(_, c)| c).collect())
    }
}

/// Generic news-feed client. Real deployments point `feed_url` at whichever
/// news aggregator the subscriber's brokerage contracts with; this client
/// only assumes the feed returns a JSON array of items.
pub struct HttpNewsSource {
    client: reqwest::Client,
    feed_url: String,
}

impl HttpNewsSource {
    pub fn new(feed_url: String) -> Self {
        Self { client: reqwest::Client::builder().timeout(Duration::from_secs(15)).build().unwrap_or_default(), feed_url }
    }
}

#[derive(Debug, Deserialize)]
struct FeedItem {
    title: String,
    content: String,
    url: String,
    source: String,
    publish_time: chrono::DateTime<chrono::Utc>,
}

#[async_trait]
impl NewsSource for HttpNewsSource {
    async fn fetch_latest(&self, stock_code: &str) -> Result<Vec<RawNewsItem>> {
        let items: Vec<FeedItem> = self
            .client
            .get(&self.feed_url)
            .query(&[("stock_code", stock_code)])
            .send()
            .await?
            .json()
            .await?;

        Ok(items
            .into_iter()
            .map(|i| RawNewsItem { title: i.title, content: i.content, url: i.url, source: i.source, publish_time: i.publish_time })
            .collect())
    }
}

/// Investor-category net flow (institutional/foreign/individual) and
/// intraday program-trade ticks, both from KIS's OpenAPI. A separate struct
/// from `KisPriceHistorySource` since these endpoints carry a different
/// request/response shape, but the same vendor credentials.
pub struct KisFlowSource {
    client: reqwest::Client,
    app_key: String,
    app_secret: String,
}

impl KisFlowSource {
    pub fn new(app_key: String, app_secret: String) -> Self {
        Self { client: reqwest::Client::builder().timeout(Duration::from_secs(10)).build().unwrap_or_default(), app_key, app_secret }
    }
}

#[derive(Debug, Deserialize)]
struct KisInvestorResponse {
    #[serde(default)]
    output: Vec<KisInvestorRow>,
}

#[derive(Debug, Deserialize)]
struct KisInvestorRow {
    stck_bsop_date: String,
    stck_clpr: String,
    acml_vol: String,
    frgn_ntby_qty: String,
    orgn_ntby_qty: String,
    prsn_ntby_qty: String,
    frgn_ntby_tr_pbmn: String,
}

#[derive(Debug, Deserialize)]
struct KisProgramResponse {
    output: KisProgramRow,
}

#[derive(Debug, Deserialize)]
struct KisProgramRow {
    bsop_hour: String,
    whol_ntby_qty: String,
    whol_ntby_tr_pbmn: String,
    stck_prpr: String,
    acml_vol: String,
}

impl KisFlowSource {
    /// Institutional/foreign/individual net flow for `stock_code` on
    /// `trade_date`, from KIS's daily investor-trend endpoint. The
    /// endpoint returns a trailing window of days; this picks the one
    /// matching `trade_date` exactly.
    pub async fn fetch_eod_flow(&self, stock_code: &str, trade_date: NaiveDate) -> Result<crate::flow::EodFlowRow> {
        let resp: KisInvestorResponse = self
            .client
            .get("https://openapi.koreainvestment.com:9443/uapi/domestic-stock/v1/quotations/inquire-daily-itemchartprice")
            .header("appkey", &self.app_key)
            .header("appsecret", &self.app_secret)
            .query(&[
                ("FID_COND_MRKT_DIV_CODE", "J"),
                ("FID_INPUT_ISCD", stock_code),
                ("FID_INPUT_DATE_1", &trade_date.format("%Y%m%d").to_string()),
                ("FID_INPUT_DATE_2", &trade_date.format("%Y%m%d").to_string()),
                ("FID_PERIOD_DIV_CODE", "D"),
                ("FID_ORG_ADJ_PRC", "1"),
            ])
            .send()
            .await?
            .json()
            .await?;

        let date_s = trade_date.format("%Y%m%d").to_string();
        let row = resp
            .output
            .into_iter()
            .find(|r| r.stck_bsop_date == date_s)
            .ok_or_else(|| Error::NotFound(format!("no investor-flow row for {stock_code} on {date_s}")))?;

        let close_price: f64 = row.stck_clpr.parse().unwrap_or(0.0);
        let volume: i64 = row.acml_vol.parse().unwrap_or(0);
        let foreign_net: f64 = row.frgn_ntby_qty.parse().unwrap_or(0.0);
        let individual_net: f64 = row.prsn_ntby_qty.parse().unwrap_or(0.0);
        let inst_net: f64 = row.orgn_ntby_qty.parse().unwrap_or(0.0);
        let total_value: f64 = row.frgn_ntby_tr_pbmn.parse().unwrap_or(0.0);

        Ok(crate::flow::EodFlowRow {
            trade_date,
            ticker: stock_code.to_string(),
            inst_net,
            foreign_net,
            individual_net,
            total_value,
            close_price,
            volume,
        })
    }

    /// Current intraday program-trade net volume for `stock_code`, from
    /// KIS's program-trade tick endpoint. `side` is derived from the sign
    /// of the net volume: positive is program buying, negative selling.
    pub async fn fetch_program_tick(&self, stock_code: &str) -> Result<crate::flow::ProgramTick> {
        let resp: KisProgramResponse = self
            .client
            .get("https://openapi.koreainvestment.com:9443/uapi/domestic-stock/v1/quotations/program-trade-intraday")
            .header("appkey", &self.app_key)
            .header("appsecret", &self.app_secret)
            .query(&[("FID_COND_MRKT_DIV_CODE", "J"), ("FID_INPUT_ISCD", stock_code)])
            .send()
            .await?
            .json()
            .await?;

        let net_volume: i64 = resp.output.whol_ntby_qty.parse().unwrap_or(0);
        let net_value: f64 = resp.output.whol_ntby_tr_pbmn.parse().unwrap_or(0.0);
        let price: f64 = resp.output.stck_prpr.parse().unwrap_or(0.0);
        let total_volume: i64 = resp.output.acml_vol.parse().unwrap_or(0);
        let side = if net_volume >= 0 { "buy" } else { "sell" }.to_string();

        Ok(crate::flow::ProgramTick {
            ts: chrono::Utc::now(),
            ticker: stock_code.to_string(),
            net_volume,
            net_value,
            side,
            price,
            total_volume,
        })
    }
}

