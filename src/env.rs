use std::collections::HashMap;
use std::env as stdenv;
use std::ops::{Deref, DerefMut};

/// One scope of shell variables.
///
/// Values are plain strings; an unset variable is simply absent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Frame {
    vars: HashMap<String, String>,
}

impl Frame {
    /// Capture the variables of the current process.
    pub fn from_process() -> Self {
        Self {
            vars: stdenv::vars().collect(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, val: impl Into<String>) {
        self.vars.insert(key.into(), val.into());
    }

    pub fn unset(&mut self, key: &str) -> Option<String> {
        self.vars.remove(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Variables sorted by name, the order `env` prints them in.
    pub fn sorted(&self) -> Vec<(&str, &str)> {
        let mut vars: Vec<_> = self.iter().collect();
        vars.sort_unstable();
        vars
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Frame {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            vars: iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }
}

/// Stack of variable scopes used by the interpreter.
///
/// The bottom frame holds the environment inherited from the process and is
/// never popped. Every command or subshell invocation pushes a full copy of
/// the top frame, mutates it freely and pops it when the invocation ends.
/// Nothing is merged back into the parent on pop.
#[derive(Debug, Clone)]
pub struct EnvStack {
    root: Frame,
    scopes: Vec<Frame>,
}

impl EnvStack {
    pub fn new(root: Frame) -> Self {
        Self {
            root,
            scopes: Vec::new(),
        }
    }

    /// Stack whose root frame is the environment of the current process.
    pub fn from_process() -> Self {
        Self::new(Frame::from_process())
    }

    pub fn current(&self) -> &Frame {
        self.scopes.last().unwrap_or(&self.root)
    }

    pub fn current_mut(&mut self) -> &mut Frame {
        match self.scopes.last_mut() {
            Some(frame) => frame,
            None => &mut self.root,
        }
    }

    pub fn root_mut(&mut self) -> &mut Frame {
        &mut self.root
    }

    pub fn depth(&self) -> usize {
        self.scopes.len() + 1
    }

    pub fn push(&mut self) {
        let top = self.current().clone();
        self.scopes.push(top);
    }

    /// Discard the top frame. The root frame cannot be popped.
    pub fn pop(&mut self) -> Option<Frame> {
        self.scopes.pop()
    }

    /// Push a frame that is popped again when the guard goes out of scope,
    /// on every exit path including `?` and panics unwinding through it.
    pub fn scoped(&mut self) -> ScopeGuard<'_> {
        self.push();
        ScopeGuard { stack: self }
    }

    /// Independent stack rooted at a copy of the current frame.
    ///
    /// Concurrent pipeline stages each get one so that their push/pop pairs
    /// never interleave on a shared stack.
    pub fn fork(&self) -> EnvStack {
        EnvStack::new(self.current().clone())
    }

    pub fn get_var(&self, key: &str) -> Option<&str> {
        self.current().get(key)
    }

    pub fn set_var(&mut self, key: impl Into<String>, val: impl Into<String>) {
        self.current_mut().set(key, val);
    }
}

impl Default for EnvStack {
    fn default() -> Self {
        Self::new(Frame::default())
    }
}

/// Frame pushed by [`EnvStack::scoped`].
pub struct ScopeGuard<'a> {
    stack: &'a mut EnvStack,
}

impl Deref for ScopeGuard<'_> {
    type Target = EnvStack;

    fn deref(&self) -> &EnvStack {
        self.stack
    }
}

impl DerefMut for ScopeGuard<'_> {
    fn deref_mut(&mut self) -> &mut EnvStack {
        self.stack
    }
}

impl Drop for ScopeGuard<'_> {
    fn drop(&mut self) {
        self.stack.pop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stack() -> EnvStack {
        EnvStack::new([("HOME", "/home/me")].into_iter().collect())
    }

    #[test]
    fn test_env_set_and_get_var() {
        let mut env = EnvStack::default();

        assert_eq!(env.get_var("SOME_RANDOM_ENV_VAR_12345"), None);

        env.set_var("KEY", "VALUE");

        assert_eq!(env.get_var("KEY"), Some("VALUE"));
    }

    #[test]
    fn test_env_reads_from_process_env() {
        let env = EnvStack::from_process();
        assert!(env.get_var("PATH").is_some());
    }

    #[test]
    fn push_copies_and_pop_discards() {
        let mut env = stack();
        env.push();
        assert_eq!(env.get_var("HOME"), Some("/home/me"));
        env.set_var("LOCAL", "1");
        env.current_mut().unset("HOME");

        let popped = env.pop().expect("child frame");
        assert_eq!(popped.get("LOCAL"), Some("1"));
        assert_eq!(env.get_var("LOCAL"), None);
        assert_eq!(env.get_var("HOME"), Some("/home/me"));
    }

    #[test]
    fn root_frame_is_never_popped() {
        let mut env = stack();
        assert!(env.pop().is_none());
        assert_eq!(env.depth(), 1);
        assert_eq!(env.get_var("HOME"), Some("/home/me"));
    }

    #[test]
    fn scope_guard_pops_on_early_return() {
        fn fails(env: &mut EnvStack) -> Result<(), ()> {
            let mut scope = env.scoped();
            scope.set_var("TEMP", "x");
            Err(())
        }

        let mut env = stack();
        assert!(fails(&mut env).is_err());
        assert_eq!(env.depth(), 1);
        assert_eq!(env.get_var("TEMP"), None);
    }

    #[test]
    fn fork_is_isolated_from_parent() {
        let mut env = stack();
        let mut fork = env.fork();
        fork.set_var("CHILD", "yes");
        env.set_var("PARENT", "yes");

        assert_eq!(env.get_var("CHILD"), None);
        assert_eq!(fork.get_var("PARENT"), None);
        assert_eq!(fork.get_var("HOME"), Some("/home/me"));
    }
}
