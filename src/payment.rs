//! Paid-book checkout against a Pesapal-style gateway.
//!
//! Checkout creates a local pending payment, registers the order with the
//! gateway and hands the redirect URL back to the client. Verification polls
//! the gateway's transaction-status endpoint a bounded number of times with
//! exponential backoff; a payment left pending after the last attempt stays
//! pending and can be verified again later.

use crate::config::PaymentConfig;
use crate::db::{Book, Database, Payment, PaymentStatus, User, now_timestamp};
use crate::error::{AppError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Serialize)]
struct CreateOrderRequest<'a> {
    id: &'a str,
    currency: &'a str,
    amount: f64,
    description: String,
    callback_url: &'a str,
    billing_address: BillingAddress<'a>,
}

#[derive(Debug, Serialize)]
struct BillingAddress<'a> {
    email_address: &'a str,
}

#[derive(Debug, Deserialize)]
struct CreateOrderResponse {
    order_tracking_id: String,
    redirect_url: String,
}

#[derive(Debug, Deserialize)]
struct TransactionStatusResponse {
    #[serde(default)]
    payment_status_description: String,
    #[serde(default)]
    payment_method: Option<String>,
    #[serde(default)]
    confirmation_code: Option<String>,
}

/// Result of starting a checkout.
#[derive(Debug, Serialize)]
pub struct CheckoutSession {
    pub payment_id: String,
    pub order_tracking_id: String,
    pub redirect_url: String,
}

/// Backoff delay before a poll attempt, doubling per attempt. The exponent
/// is clamped so an outsized attempt budget cannot overflow the arithmetic.
fn poll_delay(base_ms: u64, attempt: u32) -> u64 {
    base_ms.saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1).min(10)))
}

/// Map a gateway status description onto the local state machine. Unknown
/// descriptions stay pending rather than guessing a terminal state.
fn map_gateway_status(description: &str) -> PaymentStatus {
    match description.to_uppercase().as_str() {
        "COMPLETED" => PaymentStatus::Completed,
        "FAILED" | "INVALID" | "REVERSED" => PaymentStatus::Failed,
        "CANCELLED" => PaymentStatus::Cancelled,
        _ => PaymentStatus::Pending,
    }
}

/// HTTP client for the payment gateway.
#[derive(Clone)]
pub struct GatewayClient {
    client: reqwest::Client,
    base_url: String,
}

impl GatewayClient {
    pub fn new(base_url: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| AppError::Internal(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn create_order(&self, request: &CreateOrderRequest<'_>) -> Result<CreateOrderResponse> {
        let response = self
            .client
            .post(format!("{}/create-order", self.base_url))
            .json(request)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(AppError::Gateway(format!(
                "Order creation failed with status {}",
                response.status()
            )));
        }
        Ok(response.json().await?)
    }

    async fn transaction_status(&self, tracking_id: &str) -> Result<TransactionStatusResponse> {
        let response = self
            .client
            .get(format!("{}/transaction-status", self.base_url))
            .query(&[("orderTrackingId", tracking_id)])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(AppError::Gateway(format!(
                "Status query failed with status {}",
                response.status()
            )));
        }
        Ok(response.json().await?)
    }
}

/// Payment orchestrator.
#[derive(Clone)]
pub struct PaymentService {
    gateway: GatewayClient,
    db: Database,
    config: PaymentConfig,
}

impl PaymentService {
    pub fn new(db: Database, config: PaymentConfig) -> Result<Self> {
        let gateway = GatewayClient::new(config.base_url.clone())?;
        Ok(Self {
            gateway,
            db,
            config,
        })
    }

    /// Whether a user already owns a book. Free books are always owned.
    ///
    /// A pending payment with a gateway order gets one on-the-spot status
    /// check before answering, so a purchase whose callback never arrived
    /// still unlocks the book.
    pub async fn has_paid(&self, user_id: &str, book: &Book) -> Result<bool> {
        if book.is_free || book.price <= 0.0 {
            return Ok(true);
        }
        let Some(payment) = self.db.latest_payment(user_id, &book.id)? else {
            return Ok(false);
        };
        match payment.status {
            PaymentStatus::Completed => Ok(true),
            PaymentStatus::Pending => {
                let Some(tracking_id) = payment.order_tracking_id.clone() else {
                    return Ok(false);
                };
                match self.check_once(&payment, &tracking_id).await {
                    Ok(status) => Ok(status == PaymentStatus::Completed),
                    Err(e) => {
                        tracing::warn!(payment = %payment.id, error = %e, "Ownership sync check failed");
                        Ok(false)
                    }
                }
            }
            _ => Ok(false),
        }
    }

    /// Start a checkout for a paid book.
    ///
    /// A completed payment for the pair blocks a second purchase; an open
    /// pending payment is superseded by the new one, since its gateway order
    /// may have been abandoned.
    pub async fn checkout(&self, user: &User, book: &Book) -> Result<CheckoutSession> {
        if book.is_free || book.price <= 0.0 {
            return Err(AppError::InvalidRequest(format!(
                "Book '{}' is free and needs no payment",
                book.title
            )));
        }
        if self.has_paid(&user.id, book).await? {
            return Err(AppError::InvalidRequest(
                "Book is already purchased".to_string(),
            ));
        }

        let now = now_timestamp();
        let merchant_reference = Uuid::new_v4().to_string();
        let payment = Payment {
            id: Uuid::new_v4().to_string(),
            user_id: user.id.clone(),
            book_id: book.id.clone(),
            order_id: None,
            order_tracking_id: None,
            merchant_reference: merchant_reference.clone(),
            amount: book.price,
            currency: self.config.currency.clone(),
            status: PaymentStatus::Pending,
            payment_method: None,
            confirmation_code: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        };
        self.db.create_payment(&payment)?;

        let order = self
            .gateway
            .create_order(&CreateOrderRequest {
                id: &merchant_reference,
                currency: &self.config.currency,
                amount: book.price,
                description: format!("Purchase of '{}'", book.title),
                callback_url: &self.config.callback_url,
                billing_address: BillingAddress {
                    email_address: &user.email,
                },
            })
            .await?;

        self.db
            .set_payment_tracking(&payment.id, &order.order_tracking_id)?;
        tracing::info!(
            payment = %payment.id,
            tracking = %order.order_tracking_id,
            amount = book.price,
            "Checkout started"
        );

        Ok(CheckoutSession {
            payment_id: payment.id,
            order_tracking_id: order.order_tracking_id,
            redirect_url: order.redirect_url,
        })
    }

    /// Query the gateway once and apply the result to the local payment.
    async fn check_once(&self, payment: &Payment, tracking_id: &str) -> Result<PaymentStatus> {
        let status_response = self.gateway.transaction_status(tracking_id).await?;
        let status = map_gateway_status(&status_response.payment_status_description);

        if status.is_terminal() {
            let moved = self.db.transition_payment(
                &payment.id,
                status,
                status_response.payment_method.as_deref(),
                status_response.confirmation_code.as_deref(),
            )?;
            if moved {
                tracing::info!(payment = %payment.id, status = %status.as_str(), "Payment settled");
            }
        }
        Ok(status)
    }

    /// Verify a payment against the gateway with bounded backoff polling.
    ///
    /// Polls until a terminal status arrives or the attempt budget runs out,
    /// doubling the delay between attempts. Returns the refreshed payment;
    /// already-terminal payments return immediately without a gateway call.
    pub async fn verify(&self, payment_id: &str) -> Result<Payment> {
        let payment = self
            .db
            .get_payment(payment_id)?
            .ok_or_else(|| AppError::NotFound(format!("Payment '{}' not found", payment_id)))?;

        if payment.status.is_terminal() {
            return Ok(payment);
        }
        let tracking_id = payment.order_tracking_id.clone().ok_or_else(|| {
            AppError::InvalidRequest("Payment has no gateway order yet".to_string())
        })?;

        for attempt in 0..self.config.max_poll_attempts {
            if attempt > 0 {
                let delay = poll_delay(self.config.poll_base_delay_ms, attempt);
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            match self.check_once(&payment, &tracking_id).await {
                Ok(status) if status.is_terminal() => break,
                Ok(_) => {
                    tracing::debug!(payment = %payment.id, attempt, "Payment still pending");
                }
                Err(e) => {
                    tracing::warn!(payment = %payment.id, attempt, error = %e, "Status query failed");
                }
            }
        }

        self.db
            .get_payment(payment_id)?
            .ok_or_else(|| AppError::NotFound(format!("Payment '{}' not found", payment_id)))
    }

    /// Handle the gateway redirect callback. A single status check, no
    /// polling; the client can still call verify afterwards.
    pub async fn callback(&self, tracking_id: &str) -> Result<Payment> {
        let payment = self
            .db
            .get_payment_by_tracking(tracking_id)?
            .ok_or_else(|| {
                AppError::NotFound(format!("No payment for tracking id '{}'", tracking_id))
            })?;

        if !payment.status.is_terminal() {
            if let Err(e) = self.check_once(&payment, tracking_id).await {
                tracing::warn!(payment = %payment.id, error = %e, "Callback status query failed");
            }
        }

        self.db.get_payment(&payment.id)?.ok_or_else(|| {
            AppError::NotFound(format!("Payment '{}' not found", payment.id))
        })
    }
}
