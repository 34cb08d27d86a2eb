pub mod v1alpha2;

pub use v1alpha2::{
    validate_bundle_deployment, validate_bundle_name, Bundle, BundleDeployment,
    BundleDeploymentSpec, BundleDeploymentStatus, BundleFormat, BundleInfo, BundleObject,
    BundleSource, BundleSpec, BundleStatus, BundleTemplate, ConfigMapSourceItem, GitAuth, GitRef,
    GitSource, HttpAuth, HttpSource, ImageSource, ResolvedGitRef, ResolvedSource,
};

/// API group served by this provisioner.
pub const GROUP: &str = "core.bale.dev";

/// Label carrying the owning kind, stamped on every managed object.
pub const LABEL_OWNER_KIND: &str = "core/owner-kind";
/// Label carrying the owning BundleDeployment name.
pub const LABEL_OWNER_NAME: &str = "core/owner-name";

/// Finalizer blocking BundleDeployment deletion until the release is gone.
pub const FINALIZER_RELEASE_CLEANUP: &str = "core.bale.dev/release-cleanup";

/// Field manager used for all server-side-apply patches.
pub const FIELD_MANAGER: &str = "bale-provisioner";

/// Hotloop protection: live Bundles allowed per BundleDeployment.
pub const MAX_GENERATED_BUNDLE_LIMIT: usize = 4;

/// Generated bundle names embed a 6-character hash plus a separator, so the
/// parent name has to leave room under the 52-character bundle cap.
pub const MAX_BUNDLE_NAME_LEN: usize = 52;
pub const MAX_BUNDLE_DEPLOYMENT_NAME_LEN: usize = 45;

/// Bundle phases.
pub mod phase {
    pub const PENDING: &str = "Pending";
    pub const UNPACKING: &str = "Unpacking";
    pub const UNPACKED: &str = "Unpacked";
    pub const FAILING: &str = "Failing";
}

/// Condition types on BundleDeployment and Bundle statuses.
pub mod condition {
    pub const HAS_VALID_BUNDLE: &str = "HasValidBundle";
    pub const UNPACKED: &str = "Unpacked";
    pub const VALIDATED: &str = "Validated";
    pub const INSTALLED: &str = "Installed";
}

/// Condition reasons.
pub mod reason {
    pub const UNPACK_SUCCESSFUL: &str = "UnpackSuccessful";
    pub const UNPACK_PENDING: &str = "UnpackPending";
    pub const UNPACKING: &str = "Unpacking";
    pub const UNPACK_FAILED: &str = "UnpackFailed";
    pub const BUNDLE_LOOKUP_FAILED: &str = "BundleLookupFailed";
    pub const RECONCILE_FAILED: &str = "ReconcileFailed";

    pub const VALIDATE_SUCCESSFUL: &str = "ValidateSuccessful";
    pub const VALIDATING: &str = "Validating";
    pub const VALIDATE_FAILED: &str = "ValidateFailed";

    pub const INSTALLATION_SUCCEEDED: &str = "InstallationSucceeded";
    pub const INSTALL_FAILED: &str = "InstallFailed";
    pub const UPGRADE_FAILED: &str = "UpgradeFailed";
    pub const CREATE_DYNAMIC_WATCH_FAILED: &str = "CreateDynamicWatchFailed";
    pub const ERROR_GETTING_CLIENT: &str = "ErrorGettingClient";
    pub const ERROR_GETTING_RELEASE_STATE: &str = "ErrorGettingReleaseState";
}
