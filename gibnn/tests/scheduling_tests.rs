mod common;

use common::{mfvi_clients, toy};
use gibnn::server::{Server, ServerKind};
use gibnn::RandomState;

fn drain<F: gibnn::factor::LayerFactor>(server: &mut Server<F>) -> anyhow::Result<Vec<Vec<usize>>> {
    let mut rounds = vec![];
    while !server.is_done() {
        rounds.push(server.next_clients()?);
    }
    Ok(rounds)
}

#[test]
fn sequential_visits_each_client_once_per_pass() -> anyhow::Result<()> {
    let (key, data) = toy(RandomState::new(0), 40, 4)?;
    let (_, clients) = mfvi_clients(key, &data.parts, &[1, 3, 1])?;
    let mut server = Server::new(ServerKind::Sequential, clients, 3)?;

    let rounds = drain(&mut server)?;
    assert_eq!(rounds.len(), 12);
    for (i, round) in rounds.iter().enumerate() {
        assert_eq!(round, &vec![i % 4]);
    }
    assert_eq!(server.communications(), 24);
    Ok(())
}

#[test]
fn synchronous_selects_everyone() -> anyhow::Result<()> {
    let (key, data) = toy(RandomState::new(1), 30, 3)?;
    let (_, clients) = mfvi_clients(key, &data.parts, &[1, 3, 1])?;
    let mut server = Server::new(ServerKind::Synchronous, clients, 4)?;

    let mut expected_comms = 0;
    while !server.is_done() {
        assert_eq!(server.next_clients()?, vec![0, 1, 2]);
        expected_comms += 6;
        assert_eq!(server.communications(), expected_comms);
    }
    assert_eq!(server.curr_iter(), 4);
    assert!(server.next_clients().is_err());
    Ok(())
}

#[test]
fn mixed_runs_one_pass_then_joint_rounds() -> anyhow::Result<()> {
    let (key, data) = toy(RandomState::new(2), 40, 4)?;
    let (_, clients) = mfvi_clients(key, &data.parts, &[1, 3, 1])?;
    let mut server = Server::new(ServerKind::Mixed, clients, 1)?;
    assert_eq!(server.max_iters(), 7);

    let rounds = drain(&mut server)?;
    for (i, round) in rounds.iter().take(4).enumerate() {
        assert_eq!(round, &vec![i]);
    }
    for round in rounds.iter().skip(4) {
        assert_eq!(round, &vec![0, 1, 2, 3]);
    }
    assert_eq!(server.communications(), 4 * 2 + 3 * 8);
    Ok(())
}

#[test]
fn single_client_mixed_is_one_round() -> anyhow::Result<()> {
    let (key, data) = toy(RandomState::new(3), 20, 1)?;
    let (_, clients) = mfvi_clients(key, &data.parts, &[1, 3, 1])?;
    let mut server = Server::new(ServerKind::Mixed, clients, 5)?;
    assert_eq!(drain(&mut server)?, vec![vec![0]]);
    assert_eq!(server.communications(), 2);
    Ok(())
}

#[test]
fn empty_server_is_rejected() {
    let clients: Vec<gibnn::client::MfviClient> = vec![];
    assert!(Server::new(ServerKind::Sequential, clients, 1).is_err());
}
