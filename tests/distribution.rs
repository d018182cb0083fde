//! Installing certificates on targets.

use custodian::api::request::NewEnrollment;
use custodian::api::target::{DistributionOutcome, SkipReason, TargetId};
use custodian::commons::error::ErrorKind;
use custodian::constants::ACTOR_DEF_TEST;
use custodian::test::FakeProbe;

mod common;

use common::Custodian;


#[tokio::test]
async fn identical_certificate_is_skipped() {
    let custodian = Custodian::start();
    let request = custodian.completed("fw1.example.com").await;
    let target = common::appliance();

    assert!(custodian.manager.distribute(request.id, &target, &ACTOR_DEF_TEST).await.unwrap().is_installed());
    let installed = custodian.manager.targets().get(&target).unwrap().last_thumbprint;

    let again = custodian.manager.distribute(request.id, &target, &ACTOR_DEF_TEST).await.unwrap();
    assert_eq!(again, DistributionOutcome::Skipped { reason: SkipReason::AlreadyInstalled });
    assert_eq!(custodian.manager.targets().get(&target).unwrap().last_thumbprint, installed);
    assert_eq!(custodian.appliance.installed(), installed);
    assert_eq!(custodian.appliance.commits(), 1);
}

#[tokio::test(start_paused = true)]
async fn failed_probe_rolls_back() {
    let custodian = Custodian::with_probe(FakeProbe::failing());
    let target = common::appliance();
    let previous = custodian.appliance.preinstall("fw1.example.com");

    let request = custodian.completed("fw1.example.com").await;
    match custodian.manager.distribute(request.id, &target, &ACTOR_DEF_TEST).await.unwrap() {
        DistributionOutcome::Failed { kind, rolled_back, .. } => {
            assert_eq!(kind, ErrorKind::Distribution);
            assert!(rolled_back);
        }
        other => panic!("expected a failure, got {}", other),
    }

    assert_eq!(custodian.appliance.installed(), Some(previous.clone()));
    assert_eq!(custodian.manager.targets().get(&target).unwrap().last_thumbprint, Some(previous));
    assert_eq!(custodian.manager.list_backups(&target).unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn failed_probe_on_fresh_target_takes_certificate_away() {
    let custodian = Custodian::with_probe(FakeProbe::failing());
    let target = common::appliance();

    let request = custodian.completed("fw1.example.com").await;
    match custodian.manager.distribute(request.id, &target, &ACTOR_DEF_TEST).await.unwrap() {
        DistributionOutcome::Failed { rolled_back, .. } => assert!(rolled_back),
        other => panic!("expected a failure, got {}", other),
    }

    eprintln!(">>>> The appliance is back to having no certificate.");
    assert_eq!(custodian.appliance.installed(), None);
    assert_eq!(custodian.manager.targets().get(&target).unwrap().last_thumbprint, None);
}

#[tokio::test]
async fn fan_out_to_all_request_targets() {
    let custodian = Custodian::start();
    let new = NewEnrollment::new("www.example.com", "WebServer")
        .with_target("applianceA")
        .with_target("web1");
    let request = custodian.manager.enroll(new, &ACTOR_DEF_TEST).await.unwrap();

    let outcomes = custodian.manager.distribute_all(request.id, &ACTOR_DEF_TEST).await.unwrap();
    assert_eq!(outcomes.len(), 2);
    for (target, outcome) in &outcomes {
        assert!(outcome.is_installed(), "{}: {}", target, outcome);
    }

    let web1 = custodian.manager.targets().get(&TargetId::from("web1")).unwrap();
    assert_eq!(web1.last_thumbprint, request.thumbprint);
}
