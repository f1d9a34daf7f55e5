pub mod bookings;
pub mod coach;
pub mod feedback;
pub mod health;
pub mod tickets;

use axum::{
    middleware::from_fn_with_state,
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::{auth, AppState};

/// Command surface called by the chat gateway.
pub fn router(state: Arc<AppState>) -> Router {
    // 1. Wizard + ticket lifecycle
    let ticket_routes = Router::new()
        .route("/api/tickets", post(tickets::create_ticket))
        .route("/api/tickets/{ticket_id}", delete(tickets::close_ticket))
        .route("/api/tickets/{ticket_id}/type", post(tickets::select_type))
        .route("/api/tickets/{ticket_id}/quantity", post(tickets::select_quantity))
        .route("/api/tickets/{ticket_id}/date", post(tickets::select_date))
        .route("/api/tickets/{ticket_id}/slot", post(tickets::select_slot))
        .route("/api/tickets/{ticket_id}/reschedule", post(tickets::reschedule));

    // 2. Student self-service + feedback
    let student_routes = Router::new()
        .route("/api/bookings/mine", get(bookings::my_sessions))
        .route("/api/bookings/{id}/cancel", post(bookings::cancel_booking))
        .route("/api/feedback/{booking_id}/rating", post(feedback::submit_rating))
        .route("/api/feedback/{booking_id}/comment", post(feedback::submit_comment))
        .route("/api/feedback/{booking_id}/share", post(feedback::submit_share));

    // 3. Coach commands
    let coach_routes = Router::new()
        .route("/api/coach/bookings/clear", post(coach::clear_bookings))
        .route("/api/coach/bookings/{id}", get(coach::view_booking))
        .route("/api/coach/bookings/{id}/cancel", post(coach::cancel_booking))
        .route("/api/coach/bookings/{id}/complete", post(coach::mark_completed))
        .route("/api/coach/bookings/{id}/no-show", post(coach::mark_no_show))
        .route("/api/coach/bookings/{id}/schedule", post(coach::schedule_booking))
        .route("/api/coach/bookings/{id}/notes", post(coach::annotate_booking))
        .route("/api/coach/sessions", post(coach::add_sessions))
        .route("/api/coach/planning", get(coach::planning))
        .route("/api/coach/analytics", get(coach::analytics))
        .route("/api/coach/clients/{user_id}/stats", get(coach::client_stats))
        .route(
            "/api/coach/clients/{user_id}/notes",
            get(coach::list_notes).post(coach::add_note),
        );

    let signed_routes = Router::new()
        .merge(ticket_routes)
        .merge(student_routes)
        .merge(coach_routes)
        .route_layer(from_fn_with_state(state.clone(), auth::require_gateway));

    Router::new()
        .route("/api/health", get(health::health))
        .merge(signed_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{sign, ACTOR_HEADER, SIGNATURE_HEADER, TIMESTAMP_HEADER};
    use crate::calendar::CalendarProvider;
    use crate::db;
    use crate::desk::CoachDesk;
    use crate::feedback::FeedbackFlows;
    use crate::models::BookingStatus;
    use crate::notify::Notifier;
    use crate::session::BookingSessionManager;
    use crate::testkit::*;
    use crate::tickets::{TicketAdmissionGuard, TicketGateway};
    use crate::zone;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use chrono::{TimeDelta, Utc};
    use serde_json::{json, Value};
    use std::time::Instant;
    use tower::ServiceExt;

    const STUDENT: i64 = 42;
    const COACH: i64 = 99;

    struct Harness {
        app: Router,
        state: Arc<AppState>,
        calendar: Arc<FakeCalendar>,
        notifier: Arc<RecordingNotifier>,
        gateway: Arc<FakeGateway>,
    }

    async fn harness() -> Harness {
        let config = test_config();
        let pool = memory_pool().await;
        let calendar = Arc::new(FakeCalendar::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let gateway = Arc::new(FakeGateway::default());

        let calendar_dyn: Arc<dyn CalendarProvider> = calendar.clone();
        let notifier_dyn: Arc<dyn Notifier> = notifier.clone();
        let gateway_dyn: Arc<dyn TicketGateway> = gateway.clone();

        let state = Arc::new(AppState {
            guard: TicketAdmissionGuard::new(gateway_dyn),
            sessions: Arc::new(BookingSessionManager::new(
                pool.clone(),
                calendar_dyn.clone(),
                notifier_dyn.clone(),
                test_settings(),
            )),
            desk: CoachDesk::new(pool.clone(), calendar_dyn, notifier_dyn.clone(), test_settings()),
            feedback: Arc::new(FeedbackFlows::new(
                pool.clone(),
                notifier_dyn,
                config.feedback_chat_id,
                config.timezone,
            )),
            pool,
            config,
            started_at: Instant::now(),
        });

        Harness {
            app: router(state.clone()),
            state,
            calendar,
            notifier,
            gateway,
        }
    }

    fn signed(method: &str, uri: &str, actor: i64, body: Option<Value>) -> Request<Body> {
        let ts = Utc::now().timestamp();
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(ACTOR_HEADER, actor.to_string())
            .header(TIMESTAMP_HEADER, ts.to_string())
            .header(SIGNATURE_HEADER, sign("gateway-secret", actor, ts).unwrap());
        match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_health_is_public() {
        let h = harness().await;
        let req = Request::builder().uri("/api/health").body(Body::empty()).unwrap();
        let (status, body) = send(&h.app, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["active_sessions"], 0);
    }

    #[tokio::test]
    async fn test_unsigned_request_rejected() {
        let h = harness().await;
        let req = Request::builder()
            .uri("/api/bookings/mine")
            .header(ACTOR_HEADER, "42")
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(&h.app, req).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["ok"], false);
    }

    #[tokio::test]
    async fn test_free_booking_through_wizard() {
        let h = harness().await;

        let (status, body) = send(
            &h.app,
            signed("POST", "/api/tickets", STUDENT, Some(json!({ "display_name": "Anna" }))),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["step"], "awaiting_type");
        let ticket_id = body["data"]["ticket"]["ticket_id"].as_str().unwrap().to_string();

        let (_, body) = send(
            &h.app,
            signed(
                "POST",
                &format!("/api/tickets/{ticket_id}/type"),
                STUDENT,
                Some(json!({ "booking_type": "free" })),
            ),
        )
        .await;
        assert_eq!(body["data"], "awaiting_date");

        let day = zone::local_date(chrono_tz::Europe::Paris, Utc::now()) + TimeDelta::days(2);
        let (status, body) = send(
            &h.app,
            signed(
                "POST",
                &format!("/api/tickets/{ticket_id}/date"),
                STUDENT,
                Some(json!({ "date": day })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["step"], "awaiting_slot");
        let first = body["data"]["slots"][0].clone();
        assert!(first.is_string());

        let (status, body) = send(
            &h.app,
            signed(
                "POST",
                &format!("/api/tickets/{ticket_id}/slot"),
                STUDENT,
                Some(json!({ "start": first })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["outcome"], "booked");
        assert_eq!(h.calendar.created_count(), 1);
        assert!(!h.notifier.operator().is_empty());

        let (_, body) = send(&h.app, signed("GET", "/api/bookings/mine", STUDENT, None)).await;
        assert_eq!(body["data"]["upcoming"].as_array().unwrap().len(), 1);
        assert_eq!(h.state.sessions.active_count(), 0);
    }

    #[tokio::test]
    async fn test_second_ticket_conflicts() {
        let h = harness().await;
        let create = || signed("POST", "/api/tickets", STUDENT, Some(json!({ "display_name": "Anna" })));

        let (status, _) = send(&h.app, create()).await;
        assert_eq!(status, StatusCode::OK);
        let (status, body) = send(&h.app, create()).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(body["error"].as_str().unwrap().contains("ticket-anna-1"));
        assert_eq!(h.gateway.created_count(), 1);
    }

    #[tokio::test]
    async fn test_coach_opens_ticket_for_student() {
        let h = harness().await;
        let body = json!({ "display_name": "Anna", "user_id": STUDENT });

        let (status, _) = send(&h.app, signed("POST", "/api/tickets", 7, Some(body.clone()))).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, body) = send(&h.app, signed("POST", "/api/tickets", COACH, Some(body))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["ticket"]["owner_user_id"], STUDENT);
    }

    #[tokio::test]
    async fn test_close_ticket_discards_session() {
        let h = harness().await;
        let (_, body) = send(
            &h.app,
            signed("POST", "/api/tickets", STUDENT, Some(json!({ "display_name": "Anna" }))),
        )
        .await;
        let ticket_id = body["data"]["ticket"]["ticket_id"].as_str().unwrap().to_string();

        let (status, body) =
            send(&h.app, signed("DELETE", &format!("/api/tickets/{ticket_id}"), STUDENT, None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["session_discarded"], true);
        assert_eq!(h.gateway.closed(), vec![ticket_id.clone()]);

        let (status, _) = send(
            &h.app,
            signed(
                "POST",
                &format!("/api/tickets/{ticket_id}/type"),
                STUDENT,
                Some(json!({ "booking_type": "free" })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::GONE);
    }

    #[tokio::test]
    async fn test_coach_routes_require_privilege() {
        let h = harness().await;
        let (status, _) = send(&h.app, signed("GET", "/api/coach/planning", STUDENT, None)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, body) = send(&h.app, signed("GET", "/api/coach/planning?period=today", COACH, None)).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["data"].as_array().unwrap().is_empty());

        let (status, _) = send(&h.app, signed("GET", "/api/coach/analytics?period=decade", COACH, None)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_coach_cancels_and_client_is_told() {
        let h = harness().await;
        let client = db::upsert_client(&h.state.pool, STUDENT, "Anna", Utc::now()).await.unwrap();
        let id = db::insert_booking(
            &h.state.pool,
            &new_booking(client.id, Utc::now() + TimeDelta::days(3), BookingStatus::Confirmed),
        )
        .await
        .unwrap();

        let (status, body) = send(
            &h.app,
            signed("POST", &format!("/api/coach/bookings/{id}/cancel"), COACH, None),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["status"], "cancelled");
        assert_eq!(body["data"]["client_name"], "Anna");
        assert_eq!(h.notifier.direct_to(STUDENT).len(), 1);

        let (status, _) = send(
            &h.app,
            signed("POST", &format!("/api/bookings/{id}/cancel"), STUDENT, None),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_student_cannot_cancel_foreign_booking() {
        let h = harness().await;
        let client = db::upsert_client(&h.state.pool, STUDENT, "Anna", Utc::now()).await.unwrap();
        let id = db::insert_booking(
            &h.state.pool,
            &new_booking(client.id, Utc::now() + TimeDelta::days(3), BookingStatus::Confirmed),
        )
        .await
        .unwrap();

        let (status, _) = send(&h.app, signed("POST", &format!("/api/bookings/{id}/cancel"), 7, None)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_notes_round_trip_for_coach() {
        let h = harness().await;
        db::upsert_client(&h.state.pool, STUDENT, "Anna", Utc::now()).await.unwrap();

        let (status, body) = send(
            &h.app,
            signed(
                "POST",
                &format!("/api/coach/clients/{STUDENT}/notes"),
                COACH,
                Some(json!({ "content": "wants to work on posture" })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["author_id"], COACH);

        let (_, body) = send(&h.app, signed("GET", &format!("/api/coach/clients/{STUDENT}/notes"), COACH, None)).await;
        assert_eq!(body["data"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_feedback_without_flow_is_expired() {
        let h = harness().await;
        let (status, body) = send(
            &h.app,
            signed("POST", "/api/feedback/1/rating", STUDENT, Some(json!({ "rating": 5 }))),
        )
        .await;
        assert_eq!(status, StatusCode::GONE);
        assert_eq!(body["ok"], false);
    }
}
