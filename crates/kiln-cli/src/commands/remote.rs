use super::{json_pretty, parse_reference, CmdResult, EXIT_SUCCESS};
use kiln_core::Engine;
use kiln_remote::Remote;

/// `kiln remote …` subcommands, already parsed.
pub enum RemoteAction<'a> {
    List,
    Add {
        name: &'a str,
        url: &'a str,
        verify_ssl: bool,
        insert: Option<usize>,
    },
    Remove {
        name: &'a str,
    },
    Update {
        name: &'a str,
        url: &'a str,
        verify_ssl: bool,
    },
    ListRef,
    AddRef {
        reference: &'a str,
        remote: &'a str,
    },
    RemoveRef {
        reference: &'a str,
    },
}

pub fn run(engine: &Engine, action: &RemoteAction<'_>, json: bool) -> CmdResult {
    match *action {
        RemoteAction::List => list(engine, json),
        RemoteAction::Add {
            name,
            url,
            verify_ssl,
            insert,
        } => {
            engine.registry_add(Remote::new(name, url, verify_ssl), insert)?;
            println!("added remote '{name}' ({url})");
            Ok(EXIT_SUCCESS)
        }
        RemoteAction::Remove { name } => {
            let removed = engine.registry_remove(name)?;
            println!("removed remote '{}' ({})", removed.name, removed.url);
            Ok(EXIT_SUCCESS)
        }
        RemoteAction::Update {
            name,
            url,
            verify_ssl,
        } => {
            engine.registry_update(name, url, verify_ssl)?;
            println!("updated remote '{name}' ({url})");
            Ok(EXIT_SUCCESS)
        }
        RemoteAction::ListRef => list_refs(engine, json),
        RemoteAction::AddRef { reference, remote } => {
            let reference = parse_reference(reference)?;
            engine.registry_set_reference(&reference, remote)?;
            println!("{reference} -> '{remote}'");
            Ok(EXIT_SUCCESS)
        }
        RemoteAction::RemoveRef { reference } => {
            let reference = parse_reference(reference)?;
            if engine.registry_remove_reference(&reference)? {
                println!("{reference}: provenance removed");
            } else {
                println!("{reference}: no provenance recorded");
            }
            Ok(EXIT_SUCCESS)
        }
    }
}

fn list(engine: &Engine, json: bool) -> CmdResult {
    let remotes = engine.registry_remotes()?;
    if json {
        println!("{}", json_pretty(&remotes)?);
    } else if remotes.is_empty() {
        println!("no remotes configured");
    } else {
        for r in &remotes {
            let ssl = if r.verify_ssl { "" } else { " [no ssl verify]" };
            println!("{}: {}{ssl}", r.name, r.url);
        }
    }
    Ok(EXIT_SUCCESS)
}

fn list_refs(engine: &Engine, json: bool) -> CmdResult {
    let refs = engine.registry_references()?;
    if json {
        let payload: Vec<_> = refs
            .iter()
            .map(|(r, remote)| serde_json::json!({ "reference": r, "remote": remote }))
            .collect();
        println!("{}", json_pretty(&payload)?);
    } else {
        for (r, remote) in &refs {
            println!("{r}: {remote}");
        }
    }
    Ok(EXIT_SUCCESS)
}
