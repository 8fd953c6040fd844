use camino::{Utf8Path, Utf8PathBuf};

macro_rules! define_paths {
    ($name:ident { $($field:ident : $default:expr),* $(,)? }) => {
        #[derive(Clone, Debug)]
        pub struct $name {
            $(pub $field: Utf8PathBuf,)*
        }

        impl $name {
            pub fn to_absolute(mut self, base: &Utf8Path) -> Self {
                $(self.$field = base.join(self.$field);)*
                self
            }

            pub fn new(base: &Utf8Path) -> Self {
                Self::default().to_absolute(base)
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self {
                    $($field: $default.into(),)*
                }
            }
        }
    };
}

define_paths!(RootPathRules {
    mods: "mods",
    temp: "temp",
    downloads: "downloads",
    staging: "staging",
    state: "state",
    system_state: "state/system.json",
    users: "state/users",
});

impl RootPathRules {
    /// Directories created on initialization.
    pub fn layout(&self) -> [&Utf8PathBuf; 6] {
        [
            &self.mods,
            &self.temp,
            &self.downloads,
            &self.staging,
            &self.state,
            &self.users,
        ]
    }

    pub fn user_state(&self, user: crate::models::ids::UserId) -> Utf8PathBuf {
        self.users.join(format!("{user}.json"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rules_are_rooted() {
        let rules = RootPathRules::new(Utf8Path::new("/data"));
        assert_eq!(rules.system_state, Utf8PathBuf::from("/data/state/system.json"));
        assert_eq!(
            rules.user_state(crate::models::ids::UserId(7)),
            Utf8PathBuf::from("/data/state/users/7.json")
        );
    }
}
