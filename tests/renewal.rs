//! Renewing certificates before they expire.

use chrono::Duration;

use custodian::api::request::{EnrollmentRequest, NewEnrollment, RequestState};
use custodian::api::template::EnrollmentMode;
use custodian::constants::ACTOR_DEF_TEST;
use custodian::test::web_server_template;

mod common;

use common::{Custodian, WAIT};


#[tokio::test]
async fn one_superseding_request_per_sweep() {
    let custodian = Custodian::start();
    let old = custodian.completed("fw1.example.com").await;
    assert!(custodian
        .manager
        .distribute(old.id, &common::appliance(), &ACTOR_DEF_TEST)
        .await
        .unwrap()
        .is_installed());

    eprintln!(">>>> Nothing to do while the certificate is fresh.");
    let report = custodian.manager.sweep_renewals(&ACTOR_DEF_TEST).await.unwrap();
    assert!(report.scheduled.is_empty());

    eprintln!(">>>> Once in the renewal window exactly one renewal is made.");
    custodian.expire_soon(old.id, Duration::days(5));
    let report = custodian.manager.sweep_renewals(&ACTOR_DEF_TEST).await.unwrap();
    assert_eq!(report.scheduled.len(), 1);
    let (superseded, renewal) = report.scheduled[0];
    assert_eq!(superseded, old.id);

    let renewal = custodian.manager.get_request(renewal).unwrap();
    assert_eq!(renewal.state, RequestState::Completed);
    assert_eq!(renewal.supersedes, Some(old.id));
    assert_ne!(renewal.thumbprint, old.thumbprint);
    custodian.manager.verify_history(renewal.id).unwrap();

    eprintln!(">>>> The renewal was installed in place of the old one.");
    assert_eq!(custodian.appliance.installed(), renewal.thumbprint);

    eprintln!(">>>> Sweeping again does not renew twice.");
    let report = custodian.manager.sweep_renewals(&ACTOR_DEF_TEST).await.unwrap();
    assert!(report.scheduled.is_empty());
    let renewals = custodian
        .manager
        .list_requests()
        .unwrap()
        .into_iter()
        .filter(|request| request.supersedes == Some(old.id))
        .count();
    assert_eq!(renewals, 1);
}

#[tokio::test(start_paused = true)]
async fn renewal_approved_later_is_installed_by_next_sweep() {
    let custodian = Custodian::start();
    let mut manual = web_server_template("local");
    manual.name = "Manual".into();
    manual.enrollment_mode = EnrollmentMode::Manual;
    custodian.manager.publish_template(manual, &ACTOR_DEF_TEST).unwrap();

    let old = approved(&custodian, NewEnrollment::new("fw1.example.com", "Manual").with_target("applianceA")).await;
    assert!(custodian
        .manager
        .distribute(old.id, &common::appliance(), &ACTOR_DEF_TEST)
        .await
        .unwrap()
        .is_installed());

    eprintln!(">>>> The renewal waits for an operator.");
    custodian.expire_soon(old.id, Duration::days(5));
    let report = custodian.manager.sweep_renewals(&ACTOR_DEF_TEST).await.unwrap();
    let (_, renewal) = report.scheduled[0];
    assert_eq!(report.unfinished, vec![(renewal, RequestState::PendingApproval)]);
    assert!(report.distributed.is_empty());
    assert_eq!(custodian.appliance.installed(), old.thumbprint);

    custodian.manager.approve(renewal, &ACTOR_DEF_TEST).unwrap();
    assert_eq!(
        custodian.manager.wait_for_terminal(renewal, WAIT).await.unwrap(),
        RequestState::Completed
    );
    let renewal = custodian.manager.get_request(renewal).unwrap();

    eprintln!(">>>> The next sweep installs it.");
    let report = custodian.manager.sweep_renewals(&ACTOR_DEF_TEST).await.unwrap();
    assert!(report.scheduled.is_empty());
    assert_eq!(report.distributed.len(), 1);
    assert!(report.distributed[0].2.is_installed());
    assert_eq!(custodian.appliance.installed(), renewal.thumbprint);

    eprintln!(">>>> And only once.");
    let report = custodian.manager.sweep_renewals(&ACTOR_DEF_TEST).await.unwrap();
    assert!(report.distributed.is_empty());
    assert_eq!(custodian.appliance.commits(), 2);
}

async fn approved(custodian: &Custodian, new: NewEnrollment) -> EnrollmentRequest {
    let id = custodian.manager.submit(new, &ACTOR_DEF_TEST).unwrap();
    assert_eq!(
        custodian.manager.process(id, &ACTOR_DEF_TEST).await.unwrap(),
        RequestState::PendingApproval
    );
    custodian.manager.approve(id, &ACTOR_DEF_TEST).unwrap();
    assert_eq!(
        custodian.manager.wait_for_terminal(id, WAIT).await.unwrap(),
        RequestState::Completed
    );
    custodian.manager.get_request(id).unwrap()
}
