//! named fault injection points, configured through `LOGCLEAN_FAILPOINT`, for example
//! `replica_submit=io@2,survivor_alloc=io`, only active with the `failpoints` feature

use crate::OpCode;

#[cfg(feature = "failpoints")]
mod imp {
    use crate::OpCode;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::OnceLock;

    pub(crate) const ENV_NAME: &str = "LOGCLEAN_FAILPOINT";

    #[derive(Clone, Copy)]
    enum FailAction {
        Panic,
        IoError,
        Abort,
    }

    #[derive(Clone, Copy)]
    struct Rule {
        action: FailAction,
        nth: Option<u64>,
        hits: u64,
    }

    struct State {
        raw: String,
        rules: HashMap<String, Rule>,
    }

    impl State {
        fn refresh(&mut self) {
            let current = std::env::var(ENV_NAME).unwrap_or_default();
            if current == self.raw {
                return;
            }
            self.rules = parse_rules(&current);
            self.raw = current;
        }

        fn hit(&mut self, name: &str) -> Option<FailAction> {
            self.refresh();
            let rule = self.rules.get_mut(name)?;
            rule.hits += 1;
            match rule.nth {
                Some(nth) if rule.hits != nth => None,
                _ => Some(rule.action),
            }
        }
    }

    fn parse_rules(raw: &str) -> HashMap<String, Rule> {
        let mut out = HashMap::new();

        for token in raw.split(',').map(str::trim).filter(|x| !x.is_empty()) {
            let (name, body) = token.split_once('=').unwrap_or((token, "panic"));
            if name.is_empty() {
                continue;
            }
            let (action_raw, nth_raw) = body.split_once('@').unwrap_or((body, ""));
            let action = match action_raw {
                "panic" => FailAction::Panic,
                "io" => FailAction::IoError,
                "abort" => FailAction::Abort,
                _ => continue,
            };
            let nth = nth_raw.parse::<u64>().ok().filter(|x| *x > 0);
            out.insert(
                name.to_string(),
                Rule {
                    action,
                    nth,
                    hits: 0,
                },
            );
        }
        out
    }

    fn global_state() -> &'static Mutex<State> {
        static STATE: OnceLock<Mutex<State>> = OnceLock::new();
        STATE.get_or_init(|| {
            Mutex::new(State {
                raw: String::new(),
                rules: HashMap::new(),
            })
        })
    }

    pub(crate) fn check(name: &str) -> Result<(), OpCode> {
        let action = global_state().lock().hit(name);
        match action {
            None => Ok(()),
            Some(FailAction::Panic) => panic!("failpoint panic: {name}"),
            Some(FailAction::Abort) => std::process::abort(),
            Some(FailAction::IoError) => {
                log::warn!("failpoint {name} injected error");
                Err(OpCode::Again)
            }
        }
    }

    #[cfg(test)]
    mod test {
        use super::parse_rules;

        #[test]
        fn parse() {
            let rules = parse_rules("a=io@2, b ,c=bogus,=io");
            assert_eq!(rules.len(), 2);
            assert_eq!(rules["a"].nth, Some(2));
            assert!(rules["b"].nth.is_none());
        }
    }
}

/// `Err(OpCode::Again)` when the named failpoint fires with the `io` action
#[cfg(feature = "failpoints")]
pub(crate) fn check(name: &str) -> Result<(), OpCode> {
    imp::check(name)
}

#[cfg(not(feature = "failpoints"))]
#[inline(always)]
pub(crate) fn check(_name: &str) -> Result<(), OpCode> {
    Ok(())
}
