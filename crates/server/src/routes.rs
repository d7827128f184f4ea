//! JSON API for discount approval requests.
//!
//! - `POST /api/v1/discount-requests`                     create a request (201)
//! - `GET  /api/v1/discount-requests/{id}`                current status
//! - `POST /api/v1/discount-requests/{id}/verification`   verify link token, issue code
//! - `POST /api/v1/discount-requests/{id}/link`           re-send the approval link
//! - `POST /api/v1/discount-requests/{id}/resolution`     approve or reject with the code
//! - `GET  /api/v1/discount-requests/{id}/audit`          audit trail
//! - `GET  /api/v1/deals/{deal_id}`                       deal pricing
//! - `GET  /api/v1/deals/{deal_id}/discount-requests`     requests for a deal

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use dealdesk_core::approvals::{
    CreatedRequest, LinkReissued, Resolution, VerificationOutcome,
};
use dealdesk_core::{
    ApprovalError, ApprovalId, ApprovalView, AuditEntry, DealId, DealPricing, Decision,
    DeliveryChannel, DiscountApprovalService, InterfaceClass, NewDiscountRequest, ResolveCommand,
};
use rust_decimal::Decimal;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

const CORRELATION_HEADER: &str = "x-correlation-id";

#[derive(Clone)]
pub struct ApiState {
    service: DiscountApprovalService,
    default_channel: DeliveryChannel,
}

impl ApiState {
    pub fn new(service: DiscountApprovalService) -> Self {
        Self { service, default_channel: DeliveryChannel::default() }
    }

    /// Channel used when a verification call does not name one.
    pub fn with_default_channel(mut self, channel: DeliveryChannel) -> Self {
        self.default_channel = channel;
        self
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRequestBody {
    pub deal_id: String,
    pub requester_id: String,
    pub percent: Decimal,
    pub reason: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationBody {
    pub token: String,
    #[serde(default)]
    pub channel: Option<DeliveryChannel>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReissueLinkBody {
    pub requester_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionBody {
    pub code: String,
    pub decision: String,
    pub approver_id: String,
    #[serde(default)]
    pub rejection_reason: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestResponse {
    pub request: ApprovalView,
    pub notified: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationResponse {
    pub request: ApprovalView,
    pub channel: DeliveryChannel,
    /// Present only for the dashboard channel.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub notified: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionResponse {
    pub request: ApprovalView,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pricing: Option<PricingResponse>,
    pub notified: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PricingResponse {
    pub deal_id: String,
    pub base_total: Decimal,
    pub applied_discount_percent: Option<Decimal>,
    pub discount_amount: Decimal,
    pub final_total: Decimal,
    pub updated_at: String,
}

impl From<DealPricing> for PricingResponse {
    fn from(pricing: DealPricing) -> Self {
        Self {
            deal_id: pricing.deal_id.0,
            base_total: pricing.base_total,
            applied_discount_percent: pricing.applied_discount_percent,
            discount_amount: pricing.discount_amount,
            final_total: pricing.final_total,
            updated_at: pricing.updated_at.to_rfc3339(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntryResponse {
    pub entry_id: String,
    pub action: &'static str,
    pub actor_id: Option<String>,
    pub metadata: std::collections::BTreeMap<String, String>,
    pub timestamp: String,
}

impl From<AuditEntry> for AuditEntryResponse {
    fn from(entry: AuditEntry) -> Self {
        Self {
            entry_id: entry.entry_id,
            action: entry.action.as_str(),
            actor_id: entry.actor_id,
            metadata: entry.metadata,
            timestamp: entry.timestamp.to_rfc3339(),
        }
    }
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct ApiError {
    pub error: String,
    pub kind: &'static str,
    pub retryable: bool,
    pub correlation_id: String,
}

type ApiResult<T> = Result<T, (StatusCode, Json<ApiError>)>;

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/v1/discount-requests", post(create_request))
        .route("/api/v1/discount-requests/{id}", get(request_status))
        .route("/api/v1/discount-requests/{id}/verification", post(begin_verification))
        .route("/api/v1/discount-requests/{id}/link", post(reissue_link))
        .route("/api/v1/discount-requests/{id}/resolution", post(resolve))
        .route("/api/v1/discount-requests/{id}/audit", get(audit_trail))
        .route("/api/v1/deals/{deal_id}", get(deal_pricing))
        .route("/api/v1/deals/{deal_id}/discount-requests", get(list_for_deal))
        .with_state(state)
}

pub async fn create_request(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(body): Json<CreateRequestBody>,
) -> ApiResult<(StatusCode, Json<RequestResponse>)> {
    let correlation_id = correlation_id(&headers);
    let CreatedRequest { request, notified } = state
        .service
        .create_request(NewDiscountRequest {
            deal_id: DealId(body.deal_id),
            requester_id: body.requester_id,
            percent: body.percent,
            reason: body.reason,
        })
        .await
        .map_err(|error| api_error(error, &correlation_id))?;

    info!(
        event_name = "api.discount_request.created",
        correlation_id = %correlation_id,
        request_id = %request.id,
        deal_id = %request.deal_id,
        "discount request accepted"
    );
    Ok((StatusCode::CREATED, Json(RequestResponse { request, notified })))
}

pub async fn request_status(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<ApprovalView>> {
    let correlation_id = correlation_id(&headers);
    let view = state
        .service
        .request_status(&ApprovalId(id))
        .await
        .map_err(|error| api_error(error, &correlation_id))?;
    Ok(Json(view))
}

pub async fn begin_verification(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<VerificationBody>,
) -> ApiResult<Json<VerificationResponse>> {
    let correlation_id = correlation_id(&headers);
    let channel = body.channel.unwrap_or(state.default_channel);
    let VerificationOutcome { request, channel, code, notified } = state
        .service
        .begin_verification(&ApprovalId(id), &body.token, channel)
        .await
        .map_err(|error| api_error(error, &correlation_id))?;

    Ok(Json(VerificationResponse {
        request,
        channel,
        code: code.map(|code| code.expose_secret().to_owned()),
        notified,
    }))
}

pub async fn reissue_link(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<ReissueLinkBody>,
) -> ApiResult<Json<RequestResponse>> {
    let correlation_id = correlation_id(&headers);
    let LinkReissued { request, notified } = state
        .service
        .reissue_link(&ApprovalId(id), &body.requester_id)
        .await
        .map_err(|error| api_error(error, &correlation_id))?;
    Ok(Json(RequestResponse { request, notified }))
}

pub async fn resolve(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<ResolutionBody>,
) -> ApiResult<Json<ResolutionResponse>> {
    let correlation_id = correlation_id(&headers);
    let decision = Decision::parse(&body.decision).ok_or_else(|| {
        api_error(
            ApprovalError::Validation(format!(
                "unknown decision `{}` (expected approve|reject)",
                body.decision
            )),
            &correlation_id,
        )
    })?;

    let Resolution { request, pricing, notified } = state
        .service
        .resolve(ResolveCommand {
            request_id: ApprovalId(id),
            code: body.code,
            decision,
            approver_id: body.approver_id,
            rejection_reason: body.rejection_reason,
        })
        .await
        .map_err(|error| api_error(error, &correlation_id))?;

    info!(
        event_name = "api.discount_request.resolved",
        correlation_id = %correlation_id,
        request_id = %request.id,
        status = %request.status,
        "discount request resolved"
    );
    Ok(Json(ResolutionResponse { request, pricing: pricing.map(PricingResponse::from), notified }))
}

pub async fn audit_trail(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<AuditEntryResponse>>> {
    let correlation_id = correlation_id(&headers);
    let request_id = ApprovalId(id);
    // Unknown ids are a 404 rather than an empty trail.
    state
        .service
        .request_status(&request_id)
        .await
        .map_err(|error| api_error(error, &correlation_id))?;
    let entries = state
        .service
        .audit_trail(&request_id.0)
        .await
        .map_err(|error| api_error(error, &correlation_id))?;
    Ok(Json(entries.into_iter().map(AuditEntryResponse::from).collect()))
}

pub async fn deal_pricing(
    State(state): State<ApiState>,
    Path(deal_id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<PricingResponse>> {
    let correlation_id = correlation_id(&headers);
    let pricing = state
        .service
        .deal_pricing(&DealId(deal_id))
        .await
        .map_err(|error| api_error(error, &correlation_id))?;
    Ok(Json(pricing.into()))
}

pub async fn list_for_deal(
    State(state): State<ApiState>,
    Path(deal_id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<ApprovalView>>> {
    let correlation_id = correlation_id(&headers);
    let views = state
        .service
        .list_for_deal(&DealId(deal_id))
        .await
        .map_err(|error| api_error(error, &correlation_id))?;
    Ok(Json(views))
}

fn correlation_id(headers: &HeaderMap) -> String {
    headers
        .get(CORRELATION_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty() && value.len() <= 128)
        .map(str::to_owned)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

fn api_error(error: ApprovalError, correlation_id: &str) -> (StatusCode, Json<ApiError>) {
    let interface = error.into_interface(correlation_id);
    let status = StatusCode::from_u16(interface.class.http_status())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    match interface.class {
        InterfaceClass::ServiceUnavailable => error!(
            event_name = "api.request.failed",
            correlation_id = %interface.correlation_id,
            kind = interface.kind,
            error = %interface.message,
            "discount approval request failed"
        ),
        _ => warn!(
            event_name = "api.request.refused",
            correlation_id = %interface.correlation_id,
            kind = interface.kind,
            error = %interface.message,
            "discount approval request refused"
        ),
    }

    (
        status,
        Json(ApiError {
            error: interface.user_message(),
            kind: interface.kind,
            retryable: interface.retryable,
            correlation_id: interface.correlation_id,
        }),
    )
}
