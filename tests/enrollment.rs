//! Getting certificates issued, end to end.

use std::time::Duration;

use custodian::api::request::{FailureReason, NewEnrollment, RequestState};
use custodian::api::template::EnrollmentMode;
use custodian::constants::ACTOR_DEF_TEST;
use custodian::test::web_server_template;

mod common;

use common::{CORP_ISSUING_CA, CORP_ROOT_CA, Custodian, ROOT_CA, WAIT};


#[tokio::test]
async fn issue_and_install_on_appliance() {
    let custodian = Custodian::start();

    eprintln!(">>>> Enroll fw1.example.com with the WebServer template.");
    let request = custodian.completed("fw1.example.com").await;
    let thumbprint = request.thumbprint.clone().unwrap();

    eprintln!(">>>> Its chain validates up to the root.");
    let chain = custodian.manager.chain_for(request.id).unwrap();
    assert_eq!(chain.len(), 3);
    assert_eq!(chain[2].subject_cn().as_deref(), Some(ROOT_CA));

    eprintln!(">>>> Distribute it to applianceA.");
    let outcome = custodian
        .manager
        .distribute(request.id, &common::appliance(), &ACTOR_DEF_TEST)
        .await
        .unwrap();
    assert!(outcome.is_installed());
    assert_eq!(custodian.appliance.installed(), Some(thumbprint.clone()));

    let target = custodian.manager.targets().get(&common::appliance()).unwrap();
    assert_eq!(target.last_thumbprint, Some(thumbprint));

    custodian.manager.verify_history(request.id).unwrap();
}

#[tokio::test(start_paused = true)]
async fn pending_forever_times_out() {
    let custodian = Custodian::start();

    let id = custodian
        .manager
        .submit(NewEnrollment::new("slow.example.com", "Remote"), &ACTOR_DEF_TEST)
        .unwrap();
    assert_eq!(
        custodian.manager.process(id, &ACTOR_DEF_TEST).await.unwrap(),
        RequestState::PendingApproval
    );

    let state = custodian.manager.wait_for_terminal(id, WAIT).await.unwrap();
    assert_eq!(state, RequestState::Failed(FailureReason::ApprovalTimeout));
    assert_eq!(custodian.authority.submissions(), 1);
    custodian.manager.verify_history(id).unwrap();
}

#[tokio::test(start_paused = true)]
async fn approved_remote_enrollment_completes() {
    let custodian = Custodian::start();

    let id = custodian
        .manager
        .submit(NewEnrollment::new("api.example.com", "Remote"), &ACTOR_DEF_TEST)
        .unwrap();
    assert_eq!(
        custodian.manager.process(id, &ACTOR_DEF_TEST).await.unwrap(),
        RequestState::PendingApproval
    );

    custodian.authority.approve_all();
    assert_eq!(
        custodian.manager.wait_for_terminal(id, WAIT).await.unwrap(),
        RequestState::Completed
    );

    eprintln!(">>>> The chain runs through the authority's own CAs.");
    let chain = custodian.manager.chain_for(id).unwrap();
    assert_eq!(chain.len(), 3);
    assert_eq!(chain[1].subject_cn().as_deref(), Some(CORP_ISSUING_CA));
    assert_eq!(chain[2].subject_cn().as_deref(), Some(CORP_ROOT_CA));
    let corp = custodian
        .manager
        .list_cas()
        .into_iter()
        .find(|ca| ca.common_name == CORP_ISSUING_CA)
        .unwrap();
    assert!(corp.key_ref.is_external());
    custodian.manager.verify_history(id).unwrap();
}

#[tokio::test(start_paused = true)]
async fn cancelled_submission_is_not_reused_for_new_key() {
    let custodian = Custodian::start();

    let cancelled = custodian
        .manager
        .submit(NewEnrollment::new("dup.example.com", "Remote"), &ACTOR_DEF_TEST)
        .unwrap();
    assert_eq!(
        custodian.manager.process(cancelled, &ACTOR_DEF_TEST).await.unwrap(),
        RequestState::PendingApproval
    );
    custodian.manager.cancel(cancelled, &ACTOR_DEF_TEST).unwrap();
    assert_eq!(
        custodian.manager.wait_for_terminal(cancelled, WAIT).await.unwrap(),
        RequestState::Failed(FailureReason::Cancelled)
    );

    eprintln!(">>>> A new request for the same name gets its own submission.");
    let id = custodian
        .manager
        .submit(NewEnrollment::new("dup.example.com", "Remote"), &ACTOR_DEF_TEST)
        .unwrap();
    assert_eq!(
        custodian.manager.process(id, &ACTOR_DEF_TEST).await.unwrap(),
        RequestState::PendingApproval
    );
    assert_eq!(custodian.authority.submissions(), 2);

    custodian.authority.approve_all();
    assert_eq!(
        custodian.manager.wait_for_terminal(id, WAIT).await.unwrap(),
        RequestState::Completed
    );
    custodian.manager.verify_history(id).unwrap();
}

#[tokio::test(start_paused = true)]
async fn concurrent_duplicates_submit_once() {
    let custodian = Custodian::start();
    let pipeline = custodian.manager.pipeline();

    let new = NewEnrollment::new("dup.example.com", "Remote").with_target("applianceA");
    let first = custodian.manager.submit(new.clone(), &ACTOR_DEF_TEST).unwrap();
    let second = custodian.manager.submit(new, &ACTOR_DEF_TEST).unwrap();

    let first_task = pipeline.spawn(first, &ACTOR_DEF_TEST);
    assert_eq!(first_task.await.unwrap().unwrap(), RequestState::PendingApproval);

    eprintln!(">>>> The second request waits for the first.");
    let second_task = pipeline.spawn(second, &ACTOR_DEF_TEST);
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(custodian.manager.get_request(second).unwrap().state, RequestState::Drafted);

    custodian.authority.approve_all();
    assert_eq!(
        custodian.manager.wait_for_terminal(first, WAIT).await.unwrap(),
        RequestState::Completed
    );
    assert_eq!(second_task.await.unwrap().unwrap(), RequestState::Completed);

    assert_eq!(custodian.authority.submissions(), 1);
    let first = custodian.manager.get_request(first).unwrap();
    let second = custodian.manager.get_request(second).unwrap();
    assert_eq!(second.reuses, Some(first.id));
    assert_eq!(second.thumbprint, first.thumbprint);

    eprintln!(">>>> Only one certificate ever reaches the target.");
    let target = common::appliance();
    assert!(custodian.manager.distribute(first.id, &target, &ACTOR_DEF_TEST).await.unwrap().is_installed());
    assert!(custodian.manager.distribute(second.id, &target, &ACTOR_DEF_TEST).await.unwrap().is_skipped());
    assert_eq!(custodian.appliance.commits(), 1);
}

#[tokio::test(start_paused = true)]
async fn audit_replays_as_valid_paths() {
    let custodian = Custodian::start();

    custodian.completed("fw1.example.com").await;

    let mut manual = web_server_template("local");
    manual.name = "Manual".into();
    manual.enrollment_mode = EnrollmentMode::Manual;
    custodian.manager.publish_template(manual, &ACTOR_DEF_TEST).unwrap();
    let denied = custodian
        .manager
        .submit(NewEnrollment::new("denied.example.com", "Manual"), &ACTOR_DEF_TEST)
        .unwrap();
    custodian.manager.process(denied, &ACTOR_DEF_TEST).await.unwrap();
    custodian.manager.deny(denied, "not ours", &ACTOR_DEF_TEST).unwrap();
    assert_eq!(
        custodian.manager.wait_for_terminal(denied, WAIT).await.unwrap(),
        RequestState::Failed(FailureReason::Rejected)
    );

    let cancelled = custodian
        .manager
        .submit(NewEnrollment::new("cancelled.example.com", "WebServer"), &ACTOR_DEF_TEST)
        .unwrap();
    custodian.manager.cancel(cancelled, &ACTOR_DEF_TEST).unwrap();

    let requests = custodian.manager.list_requests().unwrap();
    assert_eq!(requests.len(), 3);
    for request in requests {
        assert!(request.state.is_terminal(), "{} rests in {}", request.id, request.state);
        custodian.manager.verify_history(request.id).unwrap();
        assert!(!custodian.manager.history(request.id).is_empty());
    }
}
